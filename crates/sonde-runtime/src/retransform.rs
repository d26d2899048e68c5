//! Retransform driver
//!
//! Resolves a matcher against the loaded-type source and asks the
//! instrumentation layer to retransform each candidate. Failures are
//! contained per type; the progress sink's `finish` is guaranteed to fire.

use tracing::warn;

use sonde_kernel::instrument::{Instrumentation, TypeSource};
use sonde_kernel::matcher::TypeMatcher;

/// Observer of a retransform batch. Sink failures are swallowed and logged,
/// never allowed to interrupt the batch itself.
pub trait ProgressSink: Send + Sync {
    fn begin(&self, total: usize) -> anyhow::Result<()>;
    fn on_success(&self, type_name: &str) -> anyhow::Result<()>;
    fn on_failure(&self, type_name: &str, error: &anyhow::Error) -> anyhow::Result<()>;
    fn finish(&self, succeeded: usize, failed: usize) -> anyhow::Result<()>;
}

/// Outcome of one retransform batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetransformSummary {
    pub succeeded: usize,
    pub failed: usize,
}

/// Scoped progress reporting. `finish` fires on drop even if the batch is
/// abandoned early.
struct ProgressScope<'a> {
    sink: Option<&'a dyn ProgressSink>,
    succeeded: usize,
    failed: usize,
    finished: bool,
}

impl<'a> ProgressScope<'a> {
    fn new(sink: Option<&'a dyn ProgressSink>) -> Self {
        Self {
            sink,
            succeeded: 0,
            failed: 0,
            finished: false,
        }
    }

    fn begin(&self, total: usize) {
        if let Some(sink) = self.sink {
            if let Err(e) = sink.begin(total) {
                warn!(error = %e, "progress sink begin failed");
            }
        }
    }

    fn success(&mut self, type_name: &str) {
        self.succeeded += 1;
        if let Some(sink) = self.sink {
            if let Err(e) = sink.on_success(type_name) {
                warn!(error = %e, "progress sink success report failed");
            }
        }
    }

    fn failure(&mut self, type_name: &str, error: &anyhow::Error) {
        self.failed += 1;
        if let Some(sink) = self.sink {
            if let Err(e) = sink.on_failure(type_name, error) {
                warn!(error = %e, "progress sink failure report failed");
            }
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(sink) = self.sink {
            if let Err(e) = sink.finish(self.succeeded, self.failed) {
                warn!(error = %e, "progress sink finish failed");
            }
        }
    }

    fn into_summary(mut self) -> RetransformSummary {
        self.finish();
        RetransformSummary {
            succeeded: self.succeeded,
            failed: self.failed,
        }
    }
}

impl Drop for ProgressScope<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Drives retransformation of already-loaded types for one matcher.
pub(crate) struct RetransformDriver<'a> {
    instrumentation: &'a dyn Instrumentation,
    type_source: &'a dyn TypeSource,
}

impl<'a> RetransformDriver<'a> {
    pub fn new(instrumentation: &'a dyn Instrumentation, type_source: &'a dyn TypeSource) -> Self {
        Self {
            instrumentation,
            type_source,
        }
    }

    /// Retransform every loaded type the matcher selects. A failure on one
    /// type is logged and does not abort the rest.
    pub fn retransform(
        &self,
        matcher: &dyn TypeMatcher,
        include_core: bool,
        progress: Option<&dyn ProgressSink>,
    ) -> RetransformSummary {
        let candidates = self.type_source.find_for_retransform(matcher, include_core);
        let mut scope = ProgressScope::new(progress);
        scope.begin(candidates.len());

        for ty in &candidates {
            match self.instrumentation.retransform(ty) {
                Ok(()) => scope.success(&ty.name),
                Err(e) => {
                    warn!(type_name = %ty.name, error = %e, "retransform failed");
                    scope.failure(&ty.name, &e);
                }
            }
        }

        scope.into_summary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use sonde_kernel::instrument::{LoadedType, TypeTransformer};
    use sonde_kernel::matcher::AnyMatcher;
    use std::collections::HashSet;
    use std::sync::Arc;

    struct FakeSource {
        types: Vec<LoadedType>,
    }

    impl TypeSource for FakeSource {
        fn find_for_retransform(
            &self,
            matcher: &dyn TypeMatcher,
            include_core: bool,
        ) -> Vec<LoadedType> {
            self.types
                .iter()
                .filter(|t| matcher.matches_type(&t.name))
                .filter(|t| include_core || !t.core_type)
                .cloned()
                .collect()
        }
    }

    struct FakeInstrumentation {
        fail_types: HashSet<String>,
        attempted: Mutex<Vec<String>>,
    }

    impl Instrumentation for FakeInstrumentation {
        fn add_transformer(
            &self,
            _transformer: Arc<dyn TypeTransformer>,
            _can_retransform: bool,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        fn remove_transformer(&self, _transformer_id: u64) -> anyhow::Result<()> {
            Ok(())
        }

        fn retransform(&self, ty: &LoadedType) -> anyhow::Result<()> {
            self.attempted.lock().push(ty.name.clone());
            if self.fail_types.contains(&ty.name) {
                anyhow::bail!("redefinition rejected");
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<String>>,
        fail_on_success: bool,
    }

    impl ProgressSink for RecordingSink {
        fn begin(&self, total: usize) -> anyhow::Result<()> {
            self.calls.lock().push(format!("begin:{total}"));
            Ok(())
        }

        fn on_success(&self, type_name: &str) -> anyhow::Result<()> {
            self.calls.lock().push(format!("ok:{type_name}"));
            if self.fail_on_success {
                anyhow::bail!("sink broke");
            }
            Ok(())
        }

        fn on_failure(&self, type_name: &str, _error: &anyhow::Error) -> anyhow::Result<()> {
            self.calls.lock().push(format!("fail:{type_name}"));
            Ok(())
        }

        fn finish(&self, succeeded: usize, failed: usize) -> anyhow::Result<()> {
            self.calls.lock().push(format!("finish:{succeeded}:{failed}"));
            Ok(())
        }
    }

    #[test]
    fn test_per_type_failure_is_contained() {
        let source = FakeSource {
            types: vec![
                LoadedType::new("a").with_function("f"),
                LoadedType::new("b").with_function("f"),
                LoadedType::new("c").with_function("f"),
            ],
        };
        let instrumentation = FakeInstrumentation {
            fail_types: HashSet::from(["b".to_string()]),
            attempted: Mutex::new(Vec::new()),
        };
        let sink = RecordingSink::default();

        let driver = RetransformDriver::new(&instrumentation, &source);
        let summary = driver.retransform(&AnyMatcher, false, Some(&sink));

        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        // Every type attempted despite the failure in the middle.
        assert_eq!(*instrumentation.attempted.lock(), vec!["a", "b", "c"]);
        let calls = sink.calls.lock();
        assert_eq!(calls.first().unwrap(), "begin:3");
        assert_eq!(calls.last().unwrap(), "finish:2:1");
    }

    #[test]
    fn test_sink_failure_does_not_interrupt_batch() {
        let source = FakeSource {
            types: vec![
                LoadedType::new("a").with_function("f"),
                LoadedType::new("b").with_function("f"),
            ],
        };
        let instrumentation = FakeInstrumentation {
            fail_types: HashSet::new(),
            attempted: Mutex::new(Vec::new()),
        };
        let sink = RecordingSink {
            fail_on_success: true,
            ..RecordingSink::default()
        };

        let driver = RetransformDriver::new(&instrumentation, &source);
        let summary = driver.retransform(&AnyMatcher, false, Some(&sink));

        assert_eq!(summary.succeeded, 2);
        assert_eq!(sink.calls.lock().last().unwrap(), "finish:2:0");
    }

    #[test]
    fn test_core_types_excluded_by_default() {
        let source = FakeSource {
            types: vec![
                LoadedType::new("user").with_function("f"),
                LoadedType::new("core").with_function("f").with_core_type(true),
            ],
        };
        let instrumentation = FakeInstrumentation {
            fail_types: HashSet::new(),
            attempted: Mutex::new(Vec::new()),
        };

        let driver = RetransformDriver::new(&instrumentation, &source);
        let summary = driver.retransform(&AnyMatcher, false, None);
        assert_eq!(summary.succeeded, 1);

        let summary = driver.retransform(&AnyMatcher, true, None);
        assert_eq!(summary.succeeded, 2);
    }
}
