use slog::{o, Drain};

// Installs the global logger: terminal drain behind an async worker,
// bridged to the `log` facade so modules log through `log::` macros.
// The returned guard must be held for the lifetime of the process.
pub fn init() -> anyhow::Result<slog_scope::GlobalLoggerGuard> {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let logger = slog::Logger::root(drain, o!());

    let guard = slog_scope::set_global_logger(logger);
    slog_stdlog::init()?;
    Ok(guard)
}
