#![forbid(unsafe_code)]

use waldo_domain::{
    CatalogSnapshot, ContextId, ContextKey, EventRecord, OutlierScore, PipelineSnapshot, Snapshot,
    WaldoError,
};

/// Tables owned by the recorder schema.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Table {
    Catalogs,
    Pipelines,
    Events,
    Contexts,
    OutlierScore,
}

impl Table {
    pub const ALL: [Self; 5] = [
        Self::Catalogs,
        Self::Pipelines,
        Self::Events,
        Self::Contexts,
        Self::OutlierScore,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Catalogs => "catalogs",
            Self::Pipelines => "pipelines",
            Self::Events => "events",
            Self::Contexts => "contexts",
            Self::OutlierScore => "outlier_score",
        }
    }
}

/// A row handed to the gateway. Each variant carries its own key.
#[derive(Debug, Clone, Copy)]
pub enum Row<'a> {
    Catalog(&'a CatalogSnapshot),
    Pipeline(&'a PipelineSnapshot),
    Event(&'a EventRecord),
    Context(&'a ContextKey),
    OutlierScore(&'a OutlierScore),
}

impl<'a> Row<'a> {
    #[must_use]
    pub fn table(&self) -> Table {
        match self {
            Self::Catalog(_) => Table::Catalogs,
            Self::Pipeline(_) => Table::Pipelines,
            Self::Event(_) => Table::Events,
            Self::Context(_) => Table::Contexts,
            Self::OutlierScore(_) => Table::OutlierScore,
        }
    }

    #[must_use]
    pub fn snapshot(snapshot: &'a Snapshot) -> Self {
        match snapshot {
            Snapshot::Catalog(catalog) => Self::Catalog(catalog),
            Snapshot::Pipeline(pipeline) => Self::Pipeline(pipeline),
        }
    }
}

/// Error for a write primitive applied to a table that does not support it.
#[must_use]
pub fn unsupported(operation: &str, row: &Row<'_>) -> WaldoError {
    WaldoError::Storage(format!(
        "{operation} is not supported for table {}",
        row.table().as_str()
    ))
}

/// Write primitives available inside one transaction scope.
pub trait GatewayTransaction {
    /// Atomically inserts the row unless its key exists. Returns whether a
    /// row was inserted. A conflict is never an error.
    #[allow(clippy::missing_errors_doc)]
    fn insert_if_absent(&mut self, row: Row<'_>) -> Result<bool, WaldoError>;

    /// Appends a row and returns its generated id.
    #[allow(clippy::missing_errors_doc)]
    fn insert(&mut self, row: Row<'_>) -> Result<i64, WaldoError>;

    /// Inserts the row, or overwrites the non-key columns of the existing row.
    /// A score row naming a sample the samples table does not hold fails with
    /// [`WaldoError::UnknownSample`].
    #[allow(clippy::missing_errors_doc)]
    fn upsert(&mut self, row: Row<'_>) -> Result<(), WaldoError>;

    #[allow(clippy::missing_errors_doc)]
    fn find_context(&mut self, key: &ContextKey) -> Result<Option<ContextId>, WaldoError>;
}

/// Transactional handle to the relational backend.
pub trait StorageGateway {
    /// Creates the recorder tables if missing. Safe to call repeatedly.
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&mut self) -> Result<(), WaldoError>;

    /// Runs `f` inside one transaction. Commits when `f` returns `Ok` and
    /// rolls back on `Err` or unwind, so no partial write is ever visible.
    #[allow(clippy::missing_errors_doc)]
    fn with_transaction<T, F>(&mut self, f: F) -> Result<T, WaldoError>
    where
        F: FnOnce(&mut dyn GatewayTransaction) -> Result<T, WaldoError>;
}

impl<G: StorageGateway> StorageGateway for &mut G {
    fn migrate(&mut self) -> Result<(), WaldoError> {
        (**self).migrate()
    }

    fn with_transaction<T, F>(&mut self, f: F) -> Result<T, WaldoError>
    where
        F: FnOnce(&mut dyn GatewayTransaction) -> Result<T, WaldoError>,
    {
        (**self).with_transaction(f)
    }
}
