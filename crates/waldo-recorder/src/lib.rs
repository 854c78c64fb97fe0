#![forbid(unsafe_code)]

pub mod clock;
pub mod correlator;
pub mod detector;
pub mod recorder;
pub mod session;
pub mod validate;

pub use clock::RunClock;
pub use correlator::Correlator;
pub use detector::{Detection, OutlierDetector, Sample};
pub use recorder::{RecordOutcome, Recorder};
pub use session::RunSession;
pub use validate::{
    LoggingValidator, NodeValidator, NumericColumnsValidator, ValidatorRegistry, ValidatorTags,
    PARAMS_PREFIX,
};
