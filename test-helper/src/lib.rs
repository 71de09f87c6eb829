use uuid::Uuid;

/// Installs a formatting subscriber for the test, ignoring any already installed.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// Creates a key name which will not collide with any other test run.
///
/// Tests running against a shared store should namespace every key they touch
/// with one of these.
pub fn unique_name(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}
