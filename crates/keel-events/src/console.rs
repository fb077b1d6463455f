//! Console command registration.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use keel_core::{KeelError, KeelResult};
use keel_middleware::BoxFuture;
use tracing::{debug, info};

/// A console command.
///
/// Implemented for every `Fn(Vec<String>) -> impl Future` so async closures
/// register directly.
pub trait Command: Send + Sync + 'static {
    /// Runs the command with its arguments.
    fn run(&self, args: Vec<String>) -> BoxFuture<'static, KeelResult<()>>;
}

impl<F, Fut> Command for F
where
    F: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = KeelResult<()>> + Send + 'static,
{
    fn run(&self, args: Vec<String>) -> BoxFuture<'static, KeelResult<()>> {
        Box::pin(self(args))
    }
}

struct Registered {
    description: String,
    command: Arc<dyn Command>,
}

/// The commands available to a console process.
#[derive(Default)]
pub struct CommandSet {
    commands: BTreeMap<String, Registered>,
}

impl CommandSet {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `command` under `name`, replacing an earlier registration.
    pub fn command<C: Command>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        command: C,
    ) -> &mut Self {
        let name = name.into();
        let previous = self.commands.insert(
            name.clone(),
            Registered {
                description: description.into(),
                command: Arc::new(command),
            },
        );
        if previous.is_some() {
            debug!(command = %name, "console command replaced");
        }
        self
    }

    /// Looks up a command.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Command>> {
        self.commands.get(name).map(|r| Arc::clone(&r.command))
    }

    /// The description of a command.
    #[must_use]
    pub fn description(&self, name: &str) -> Option<&str> {
        self.commands.get(name).map(|r| r.description.as_str())
    }

    /// Command names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.commands.keys().map(String::as_str).collect()
    }

    /// Number of commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns `true` if no command is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Runs the command named `name`.
    pub async fn run(&self, name: &str, args: Vec<String>) -> KeelResult<()> {
        let command = self
            .get(name)
            .ok_or_else(|| KeelError::bad_request(format!("unknown command {name}")))?;
        info!(command = %name, "running console command");
        command.run(args).await
    }
}

impl fmt::Debug for CommandSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSet")
            .field("commands", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_run_passes_arguments() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);

        let mut set = CommandSet::new();
        set.command("count", "Counts its arguments", move |args: Vec<String>| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(args.len(), Ordering::SeqCst);
                Ok::<_, KeelError>(())
            }
        });

        set.run("count", vec!["a".into(), "b".into()]).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let set = CommandSet::new();
        let err = set.run("nope", Vec::new()).await.unwrap_err();
        assert!(matches!(err, KeelError::BadRequest { .. }));
    }

    #[test]
    fn test_last_registration_wins() {
        let mut set = CommandSet::new();
        set.command("x", "first", |_args: Vec<String>| async { Ok::<_, KeelError>(()) })
            .command("x", "second", |_args: Vec<String>| async { Ok::<_, KeelError>(()) })
            .command("a", "alpha", |_args: Vec<String>| async { Ok::<_, KeelError>(()) });

        assert_eq!(set.len(), 2);
        assert_eq!(set.description("x"), Some("second"));
        assert_eq!(set.names(), vec!["a", "x"]);
    }
}
