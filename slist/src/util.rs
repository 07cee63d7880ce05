macro_rules! test_trace {
    ($($tt:tt)*) => {
        #[cfg(test)]
        tracing::trace!($($tt)*)
    }
}

#[cfg(test)]
pub(crate) fn assert_send_sync<T: Send + Sync>() {}

#[cfg(all(test, not(loom)))]
pub(crate) fn trace_init() -> tracing::subscriber::DefaultGuard {
    use tracing_subscriber::{
        filter::{EnvFilter, LevelFilter},
        util::SubscriberInitExt,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .without_time()
        .finish()
        .set_default()
}
