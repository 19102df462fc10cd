use std::{
    collections::HashMap,
    path::Path,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use tracing::{Level, Metadata, callsite::Identifier, subscriber::Interest};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer as _,
    filter::{Targets, filter_fn},
    fmt,
    layer::{Context, Filter, SubscriberExt as _},
    util::SubscriberInitExt as _,
};

/// Target of the per-request and per-record access entries.
pub const ACCESS_TARGET: &str = "kvbuf::access";

/// Keeps the access log writer flushing until dropped.
pub struct LoggingGuard {
    _access: Option<WorkerGuard>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerOptions {
    pub tick: Duration,
    pub first: u64,
    pub thereafter: u64,
}

/// Thins out access entries. Within each tick, every call site passes its
/// first `first` entries and then every `thereafter`-th one. Other targets
/// are never filtered.
pub struct AccessSampler {
    opts: SamplerOptions,
    window: Mutex<SampleWindow>,
}

#[derive(Default)]
struct SampleWindow {
    started: Option<Instant>,
    seen: HashMap<Identifier, u64>,
}

impl AccessSampler {
    pub fn new(opts: SamplerOptions) -> Self {
        Self {
            opts,
            window: Mutex::new(SampleWindow::default()),
        }
    }

    fn admit(&self, site: Identifier, now: Instant) -> bool {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        if window
            .started
            .is_none_or(|started| now.duration_since(started) >= self.opts.tick)
        {
            window.started = Some(now);
            window.seen.clear();
        }
        let n = window.seen.entry(site).or_insert(0);
        *n += 1;
        *n <= self.opts.first || (*n - self.opts.first) % self.opts.thereafter.max(1) == 0
    }
}

impl<S> Filter<S> for AccessSampler {
    fn enabled(&self, meta: &Metadata<'_>, _cx: &Context<'_, S>) -> bool {
        if meta.target() != ACCESS_TARGET || !meta.is_event() {
            return true;
        }
        self.admit(meta.callsite(), Instant::now())
    }

    fn callsite_enabled(&self, meta: &'static Metadata<'static>) -> Interest {
        if meta.target() == ACCESS_TARGET {
            Interest::sometimes()
        } else {
            Interest::always()
        }
    }
}

/// Process log to stderr, filtered by `RUST_LOG` (default `info`).
///
/// With `log_dir`, access entries are split off into a daily rolling
/// `access.log` there and dropped from the process log. `sampler` thins
/// access entries wherever they are written.
pub fn init_tracing(
    log_dir: Option<&Path>,
    sampler: Option<SamplerOptions>,
) -> std::io::Result<LoggingGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let sampler = sampler.map(AccessSampler::new);

    let Some(dir) = log_dir else {
        tracing_subscriber::registry()
            .with(fmt::layer().compact().with_filter(filter).with_filter(sampler))
            .init();
        return Ok(LoggingGuard { _access: None });
    };

    std::fs::create_dir_all(dir)?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
        dir,
        "access.log",
    ));

    let process = fmt::layer()
        .compact()
        .with_filter(filter)
        .with_filter(filter_fn(|meta| meta.target() != ACCESS_TARGET));
    let access = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .with_filter(Targets::new().with_target(ACCESS_TARGET, Level::INFO))
        .with_filter(sampler);

    tracing_subscriber::registry()
        .with(process)
        .with(access)
        .init();
    Ok(LoggingGuard {
        _access: Some(guard),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };
    use tracing::{Event, Subscriber};
    use tracing_subscriber::Layer;

    #[derive(Clone, Default)]
    struct Counter(Arc<AtomicUsize>);

    impl<S: Subscriber> Layer<S> for Counter {
        fn on_event(&self, _event: &Event<'_>, _cx: Context<'_, S>) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn sampled(opts: SamplerOptions, emit: impl FnOnce()) -> usize {
        let counter = Counter::default();
        let subscriber = tracing_subscriber::registry()
            .with(counter.clone().with_filter(AccessSampler::new(opts)));
        tracing::subscriber::with_default(subscriber, emit);
        counter.0.load(Ordering::Relaxed)
    }

    #[test]
    fn keeps_first_then_every_nth_access_entry() {
        let opts = SamplerOptions {
            tick: Duration::from_secs(3600),
            first: 3,
            thereafter: 4,
        };
        let seen = sampled(opts, || {
            for i in 0..12 {
                tracing::info!(target: ACCESS_TARGET, i, "access");
            }
            for _ in 0..5 {
                tracing::info!("process");
            }
        });
        // Entries 1, 2, 3, 7 and 11 of the access call site, all process ones.
        assert_eq!(seen, 5 + 5);
    }

    #[test]
    fn counts_restart_each_tick() {
        let opts = SamplerOptions {
            tick: Duration::from_millis(20),
            first: 1,
            thereafter: 1000,
        };
        let seen = sampled(opts, || {
            for _ in 0..3 {
                for _ in 0..10 {
                    tracing::info!(target: ACCESS_TARGET, "access");
                }
                std::thread::sleep(Duration::from_millis(30));
            }
        });
        assert_eq!(seen, 3);
    }
}

/// Collects the fields of access entries emitted while its guard is alive.
#[cfg(test)]
pub(crate) mod capture {
    use std::{
        collections::BTreeMap,
        fmt::Debug,
        sync::{Arc, Mutex},
    };

    use tracing::{
        Event, Subscriber,
        field::{Field, Visit},
        subscriber::DefaultGuard,
    };
    use tracing_subscriber::{Layer, layer::Context, layer::SubscriberExt as _};

    use super::ACCESS_TARGET;

    pub(crate) type Entry = BTreeMap<String, String>;

    #[derive(Clone, Default)]
    pub(crate) struct AccessEntries(Arc<Mutex<Vec<Entry>>>);

    impl AccessEntries {
        pub(crate) fn install() -> (Self, DefaultGuard) {
            let entries = Self::default();
            let guard =
                tracing::subscriber::set_default(tracing_subscriber::registry().with(entries.clone()));
            (entries, guard)
        }

        pub(crate) fn take(&self) -> Vec<Entry> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    impl<S: Subscriber> Layer<S> for AccessEntries {
        fn on_event(&self, event: &Event<'_>, _cx: Context<'_, S>) {
            if event.metadata().target() != ACCESS_TARGET {
                return;
            }
            let mut fields = Fields::default();
            event.record(&mut fields);
            self.0.lock().unwrap().push(fields.0);
        }
    }

    #[derive(Default)]
    struct Fields(Entry);

    impl Visit for Fields {
        fn record_str(&mut self, field: &Field, value: &str) {
            self.0.insert(field.name().to_string(), value.to_string());
        }

        fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
            self.0.insert(field.name().to_string(), format!("{value:?}"));
        }
    }
}
