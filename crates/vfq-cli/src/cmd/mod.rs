pub mod config;
pub mod init;
pub mod queue;
pub mod registry;
pub mod sanitize;
pub mod step;

/// Single-threaded runtime for one command's async work.
pub(crate) fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}
