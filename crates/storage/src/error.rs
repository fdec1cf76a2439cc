use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("{entity} '{id}' does not exist (`{stage}`)"))]
    NotFound {
        stage: &'static str,
        entity: &'static str,
        id: String,
    },
    #[snafu(display("{id_type} must not be blank (`{stage}`)"))]
    EmptyId {
        stage: &'static str,
        id_type: &'static str,
    },
    #[snafu(display("stored message has unrecognized role '{role}' (`{stage}`)"))]
    UnknownMessageRole { stage: &'static str, role: String },
    #[snafu(display("conversation store is inconsistent on `{stage}`: {details}"))]
    InvariantViolation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("store worker panicked on `{stage}`"))]
    WorkerPanicked { stage: &'static str },
    #[snafu(display("cannot create database directory {path} on `{stage}`: {source}"))]
    CreateSqliteDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("invalid sqlite url '{database_url}' on `{stage}`: {source}"))]
    SqliteConnectOptions {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("cannot open sqlite database '{database_url}' on `{stage}`: {source}"))]
    SqliteConnect {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("pragma '{pragma}' rejected on `{stage}`: {source}"))]
    SqlitePragma {
        stage: &'static str,
        pragma: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("conversation schema migration failed on `{stage}`: {source}"))]
    SqliteMigrate {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("sqlite statement failed on `{stage}`: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("cannot start sqlite worker thread on `{stage}`: {source}"))]
    SqliteThreadSpawn {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("cannot build sqlite worker runtime on `{stage}`: {source}"))]
    SqliteRuntimeInit {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;
