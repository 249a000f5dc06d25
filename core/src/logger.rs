use std::sync::{Arc, OnceLock};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

/// Log sink implemented by the embedding application
pub trait CoreLogger: Send + Sync {
    fn log(&self, level: String, message: String);
}

// Global storage for the logger callback
static GLOBAL_LOGGER: OnceLock<Arc<dyn CoreLogger>> = OnceLock::new();

/// Forwards each event's message to the registered [`CoreLogger`]
pub struct CallbackLayer;

impl<S> Layer<S> for CallbackLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if let Some(logger) = GLOBAL_LOGGER.get() {
            let level = event.metadata().level().to_string();
            let mut message = String::new();
            let mut visitor = MessageVisitor(&mut message);
            event.record(&mut visitor);
            logger.log(level, message);
        }
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            use std::fmt::Write;
            let _ = write!(self.0, "{:?}", value);
        }
    }
}

/// Route all crate logging at `level` and above to `callback`.
///
/// Only the first call installs anything.
pub fn init_logger(callback: Box<dyn CoreLogger>, level: Level) {
    if GLOBAL_LOGGER.set(Arc::from(callback)).is_err() {
        // value already set
        return;
    }

    let subscriber = tracing_subscriber::registry()
        .with(CallbackLayer)
        .with(LevelFilter::from_level(level));

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Plain stderr output for command line use and tests
pub fn init_stderr_logger() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::DEBUG)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<(String, String)>>);

    impl CoreLogger for Arc<Collect> {
        fn log(&self, level: String, message: String) {
            self.0.lock().unwrap().push((level, message));
        }
    }

    #[test]
    fn test_visitor_extracts_message_field() {
        let collected = Arc::new(Collect::default());
        let subscriber = tracing_subscriber::registry().with(CallbackLayer);
        assert!(GLOBAL_LOGGER.set(Arc::new(collected.clone())).is_ok());

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("rejected message from {}", "bob");
        });

        let entries = collected.0.lock().unwrap();
        assert_eq!(entries[0], ("WARN".to_string(), "rejected message from bob".to_string()));
    }
}
