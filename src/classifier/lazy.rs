//! # Lazy Classifier Loading
//!
//! Wraps a classifier backend so it is loaded on first use and shared by every
//! session afterwards. Model downloads and weight loading can take a long time,
//! so the server starts immediately and pays that cost on the first window that
//! actually needs a classification.
//!
//! ## Initialization Guarantee:
//! Several sessions can hit their first non-silent window at the same moment.
//! A single initialization lock makes sure exactly one of them performs the
//! load while the others wait and then reuse the result.
//!
//! ## Failure Behavior:
//! A failed load is reported as `ClassifierError::Load` and nothing is cached,
//! so the next call tries again.

use crate::classifier::{ClassifierError, EmotionClassifier, EmotionScore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;
use tracing::{error, info};

/// Something that knows how to build a classifier backend.
///
/// ## Rust Concepts:
/// - **Associated type**: Each loader names the concrete model it produces
/// - **anyhow::Result**: Loading touches the network and filesystem, so errors
///   carry context chains rather than a fixed enum
pub trait ClassifierLoader: Send + Sync {
    type Model: EmotionClassifier;

    /// Build the backend. Called at most once per successful load.
    fn load(&self) -> anyhow::Result<Self::Model>;

    /// Human-readable description used in logs (e.g. the model repository).
    fn describe(&self) -> String;
}

/// Classifier that defers backend construction until the first `classify`.
pub struct LazyClassifier<L: ClassifierLoader> {
    loader: L,

    /// The loaded backend. Set once, never replaced.
    model: OnceLock<L::Model>,

    /// Serializes load attempts so only one runs at a time.
    init_lock: Mutex<()>,

    /// Number of load attempts (successful or not)
    load_attempts: AtomicU64,
}

impl<L: ClassifierLoader> LazyClassifier<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            model: OnceLock::new(),
            init_lock: Mutex::new(()),
            load_attempts: AtomicU64::new(0),
        }
    }

    /// Return the loaded backend, loading it first if needed.
    ///
    /// ## Double-checked locking:
    /// 1. Fast path: the model is already set, no lock taken
    /// 2. Take the init lock, then check again (another caller may have
    ///    finished loading while we waited)
    /// 3. Still empty: this caller performs the load
    pub fn ensure_loaded(&self) -> Result<&L::Model, ClassifierError> {
        if let Some(model) = self.model.get() {
            return Ok(model);
        }

        // A poisoned lock only means a previous loader panicked; the cell is
        // still consistent, so keep going.
        let _guard = self.init_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(model) = self.model.get() {
            return Ok(model);
        }

        let attempt = self.load_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let description = self.loader.describe();
        info!(model = %description, attempt, "Loading emotion classifier");
        let start_time = Instant::now();

        match self.loader.load() {
            Ok(model) => {
                info!(
                    model = %description,
                    duration_ms = %start_time.elapsed().as_millis(),
                    "Emotion classifier loaded"
                );
                Ok(self.model.get_or_init(|| model))
            }
            Err(e) => {
                error!(model = %description, error = %format!("{:#}", e), "Emotion classifier failed to load");
                Err(ClassifierError::Load(format!("{:#}", e)))
            }
        }
    }

    /// How many times a load has been attempted.
    #[cfg(test)]
    pub fn load_attempts(&self) -> u64 {
        self.load_attempts.load(Ordering::SeqCst)
    }
}

impl<L: ClassifierLoader> EmotionClassifier for LazyClassifier<L> {
    fn classify(&self, samples: &[f32], sample_rate: u32) -> Result<Vec<EmotionScore>, ClassifierError> {
        self.ensure_loaded()?.classify(samples, sample_rate)
    }

    fn is_loaded(&self) -> bool {
        self.model.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    struct ConstantModel;

    impl EmotionClassifier for ConstantModel {
        fn classify(&self, _samples: &[f32], _sample_rate: u32) -> Result<Vec<EmotionScore>, ClassifierError> {
            Ok(vec![EmotionScore::new("neutral", 1.0)])
        }

        fn is_loaded(&self) -> bool {
            true
        }
    }

    /// Counts loads and sleeps a little so racing callers overlap.
    struct CountingLoader {
        loads: Arc<AtomicUsize>,
        fail_first: usize,
    }

    impl ClassifierLoader for CountingLoader {
        type Model = ConstantModel;

        fn load(&self) -> anyhow::Result<ConstantModel> {
            let attempt = self.loads.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            if attempt < self.fail_first {
                anyhow::bail!("weights unavailable");
            }
            Ok(ConstantModel)
        }

        fn describe(&self) -> String {
            "counting-stub".to_string()
        }
    }

    #[test]
    fn test_not_loaded_until_first_classify() {
        let loads = Arc::new(AtomicUsize::new(0));
        let classifier = LazyClassifier::new(CountingLoader { loads: loads.clone(), fail_first: 0 });

        assert!(!classifier.is_loaded());
        assert_eq!(loads.load(Ordering::SeqCst), 0);

        let result = classifier.classify(&[0.1, 0.2], 16000).unwrap();
        assert_eq!(result[0].label, "neutral");
        assert!(classifier.is_loaded());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_first_calls_load_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let classifier = Arc::new(LazyClassifier::new(CountingLoader { loads: loads.clone(), fail_first: 0 }));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let classifier = classifier.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    classifier.classify(&[0.5; 16], 16000).is_ok()
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap());
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(classifier.load_attempts(), 1);
    }

    #[test]
    fn test_failed_load_is_retried() {
        let loads = Arc::new(AtomicUsize::new(0));
        let classifier = LazyClassifier::new(CountingLoader { loads: loads.clone(), fail_first: 1 });

        match classifier.classify(&[0.5], 16000) {
            Err(ClassifierError::Load(msg)) => assert!(msg.contains("weights unavailable")),
            other => panic!("expected load error, got {:?}", other),
        }
        assert!(!classifier.is_loaded());

        assert!(classifier.classify(&[0.5], 16000).is_ok());
        assert!(classifier.is_loaded());
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }
}
