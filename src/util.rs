pub mod log {
    use std::sync::Once;

    use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

    pub fn init() {
        static ONCE: Once = Once::new();
        ONCE.call_once(|| {
            let subscriber = tracing_subscriber::fmt()
                .with_span_events(FmtSpan::CLOSE)
                .with_thread_names(true)
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
                )
                .finish();
            // Tests and embedding applications may have installed their own subscriber.
            let _ = tracing::subscriber::set_global_default(subscriber);
        })
    }
}

pub mod timing {
    use std::time::Instant;

    use tracing::debug;

    pub struct TimingGuard {
        t0: Instant,
        description: String,
    }

    pub fn start<S: ToString>(description: S) -> TimingGuard {
        let description = description.to_string();
        debug!("[TIMING] start {} ......", description);
        TimingGuard {
            t0: Instant::now(),
            description,
        }
    }

    impl Drop for TimingGuard {
        fn drop(&mut self) {
            debug!(
                "[TIMING] finish {} in {:?}",
                self.description,
                self.t0.elapsed(),
            );
        }
    }
}
