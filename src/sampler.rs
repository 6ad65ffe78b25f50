// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-thread CPU and wall-time sampling passes.
//!
//! A [`Sampler`] snapshots the host's live threads once per pass, keeps one
//! [`PerThreadContext`] per thread it has ever seen (until the host reports
//! the thread as exited), and emits one sample per thread to the bound
//! recorder: stack snapshot plus a metric tuple of deltas since the thread's
//! previous sighting.
//!
//! All sampler operations run inside the host's cooperative scheduling
//! region, so the per-thread map needs no locking.

use std::collections::HashMap;

use thiserror::Error;

use crate::host::HostThreads;
use crate::sample::{Label, MetricColumn, MetricValues, Recorder, SampleBuffer, StackWalker};

/// State carried for one thread between sampling passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerThreadContext {
    last_cpu_time_ns: Option<i64>,
    last_wall_time_ns: Option<i64>,
}

/// Sampler construction failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SamplerError {
    /// The requested maximum stack depth was negative.
    #[error("invalid max_frames: value must not be negative (got {requested})")]
    InvalidMaxFrames {
        /// The rejected value.
        requested: i32,
    },
}

/// Drives sampling passes over the host's live threads.
pub struct Sampler<H: HostThreads, W, R> {
    scratch: SampleBuffer,
    per_thread: HashMap<H::Handle, PerThreadContext>,
    threads: H,
    walker: W,
    recorder: Option<R>,
}

impl<H, W, R> Sampler<H, W, R>
where
    H: HostThreads,
    W: StackWalker<H::Handle>,
    R: Recorder<H::Handle>,
{
    /// Creates a sampler whose scratch buffer holds at most `max_frames`
    /// stack frames. Fails when `max_frames` is negative; zero is valid and
    /// produces empty stacks.
    pub fn new(max_frames: i32, threads: H, walker: W) -> Result<Self, SamplerError> {
        if max_frames < 0 {
            return Err(SamplerError::InvalidMaxFrames {
                requested: max_frames,
            });
        }
        Ok(Self {
            scratch: SampleBuffer::with_max_depth(max_frames as usize),
            per_thread: HashMap::new(),
            threads,
            walker,
            recorder: None,
        })
    }

    /// Attaches the recorder that receives emissions. Must happen before the
    /// first [`Sampler::sample`] call.
    pub fn bind(&mut self, recorder: R) {
        self.recorder = Some(recorder);
    }

    /// Runs one sampling pass over all currently-live threads and returns the
    /// number of emissions.
    ///
    /// A thread whose stack cannot be walked is skipped; the pass continues.
    /// Never fails: at worst a pass produces zero emissions.
    pub fn sample(&mut self) -> usize {
        let Self {
            scratch,
            per_thread,
            threads,
            walker,
            recorder,
        } = self;

        let Some(recorder) = recorder.as_mut() else {
            tracing::warn!("sample requested before a recorder was bound");
            return 0;
        };

        let snapshot = threads.thread_list();
        let wall_now = threads.monotonic_wall_time_ns();
        let mut emitted = 0;

        for thread in snapshot {
            let cpu_now = threads.cpu_time_ns(&thread);
            let context = per_thread.entry(thread.clone()).or_default();

            // First sighting emits zeros and just establishes the baseline.
            let cpu_delta = match (cpu_now, context.last_cpu_time_ns) {
                (Some(now), Some(previous)) => (now - previous).max(0),
                _ => 0,
            };
            let wall_delta = match context.last_wall_time_ns {
                Some(previous) => (wall_now - previous).max(0),
                None => 0,
            };
            context.last_cpu_time_ns = cpu_now.or(context.last_cpu_time_ns);
            context.last_wall_time_ns = Some(wall_now);

            scratch.clear();
            if let Err(err) = walker.collect_stack(&thread, scratch) {
                tracing::debug!(?thread, %err, "skipping thread, stack walk failed");
                continue;
            }

            let mut values: MetricValues = [0; MetricColumn::COUNT];
            values[MetricColumn::CpuTime.index()] = cpu_delta;
            values[MetricColumn::CpuSamples.index()] = 1;
            values[MetricColumn::WallTime.index()] = wall_delta;

            let labels: [Label<'_>; 0] = [];
            recorder.record_sample(&thread, scratch.frames(), &values, &labels);
            emitted += 1;
        }

        tracing::trace!(emitted, "sampling pass finished");
        emitted
    }

    /// The same thread enumeration [`Sampler::sample`] iterates. Exposed for
    /// test observability only.
    pub fn thread_list(&self) -> Vec<H::Handle> {
        self.threads.thread_list()
    }

    /// Opaque human-readable snapshot of the sampler state, for tests and
    /// debugging only; never parse it. Deterministic for equal state
    /// contents.
    pub fn inspect(&self) -> String {
        let mut entries: Vec<String> = self
            .per_thread
            .iter()
            .map(|(thread, context)| format!("{thread:?} => {context:?}"))
            .collect();
        entries.sort();
        format!(
            "max_depth={} per_thread={{{}}} recorder={}",
            self.scratch.max_depth(),
            entries.join(", "),
            if self.recorder.is_some() {
                "bound"
            } else {
                "unbound"
            }
        )
    }

    /// Invokes `visit` with every thread handle retained as a map key, so a
    /// host reachability traversal can mark them.
    pub fn visit_retained_threads(&self, visit: &mut dyn FnMut(&H::Handle)) {
        for thread in self.per_thread.keys() {
            visit(thread);
        }
    }

    /// The bound recorder, if any: the other reference a host reachability
    /// traversal must see.
    pub fn recorder(&self) -> Option<&R> {
        self.recorder.as_ref()
    }

    /// Number of threads with a retained context.
    pub fn tracked_threads(&self) -> usize {
        self.per_thread.len()
    }

    /// Evicts the context of a thread the host reports as exited. Returns
    /// whether a context was present.
    pub fn on_thread_exited(&mut self, thread: &H::Handle) -> bool {
        self.per_thread.remove(thread).is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;
    use std::rc::Rc;

    use crate::sample::{Frame, StackWalkError};

    use super::*;

    #[derive(Clone, Default)]
    struct FakeThreads(Rc<FakeThreadsInner>);

    #[derive(Default)]
    struct FakeThreadsInner {
        threads: RefCell<Vec<u32>>,
        cpu: RefCell<HashMap<u32, i64>>,
        wall: Cell<i64>,
    }

    impl FakeThreads {
        fn set_threads(&self, threads: &[u32]) {
            *self.0.threads.borrow_mut() = threads.to_vec();
        }

        fn set_cpu(&self, thread: u32, ns: i64) {
            self.0.cpu.borrow_mut().insert(thread, ns);
        }

        fn advance_wall(&self, ns: i64) {
            self.0.wall.set(self.0.wall.get() + ns);
        }
    }

    impl HostThreads for FakeThreads {
        type Handle = u32;

        fn thread_list(&self) -> Vec<u32> {
            self.0.threads.borrow().clone()
        }

        fn cpu_time_ns(&self, thread: &u32) -> Option<i64> {
            self.0.cpu.borrow().get(thread).copied()
        }

        fn monotonic_wall_time_ns(&self) -> i64 {
            self.0.wall.get()
        }
    }

    #[derive(Clone, Default)]
    struct FakeWalker {
        frames: Vec<&'static str>,
        fail_for: Option<u32>,
    }

    impl StackWalker<u32> for FakeWalker {
        fn collect_stack(
            &self,
            thread: &u32,
            buffer: &mut SampleBuffer,
        ) -> Result<(), StackWalkError> {
            if self.fail_for == Some(*thread) {
                return Err(StackWalkError("thread is gone".into()));
            }
            for name in &self.frames {
                if !buffer.try_push(Frame {
                    name: (*name).into(),
                    line: 1,
                }) {
                    break;
                }
            }
            Ok(())
        }
    }

    struct RecordedSample {
        thread: u32,
        stack_depth: usize,
        values: MetricValues,
        labels: usize,
    }

    #[derive(Clone, Default)]
    struct FakeRecorder(Rc<RefCell<Vec<RecordedSample>>>);

    impl Recorder<u32> for FakeRecorder {
        fn record_sample(
            &mut self,
            thread: &u32,
            stack: &[Frame],
            values: &MetricValues,
            labels: &[Label<'_>],
        ) {
            self.0.borrow_mut().push(RecordedSample {
                thread: *thread,
                stack_depth: stack.len(),
                values: *values,
                labels: labels.len(),
            });
        }
    }

    fn sampler(
        max_frames: i32,
        threads: &FakeThreads,
        walker: FakeWalker,
    ) -> (
        Sampler<FakeThreads, FakeWalker, FakeRecorder>,
        Rc<RefCell<Vec<RecordedSample>>>,
    ) {
        let recorder = FakeRecorder::default();
        let recorded = recorder.0.clone();
        let mut sampler = Sampler::new(max_frames, threads.clone(), walker).unwrap();
        sampler.bind(recorder);
        (sampler, recorded)
    }

    #[test]
    fn negative_max_frames_is_rejected() {
        let threads = FakeThreads::default();
        let result: Result<Sampler<_, FakeWalker, FakeRecorder>, _> =
            Sampler::new(-1, threads, FakeWalker::default());
        assert_eq!(
            result.err(),
            Some(SamplerError::InvalidMaxFrames { requested: -1 })
        );
    }

    #[test]
    fn zero_max_frames_produces_empty_stacks() {
        let threads = FakeThreads::default();
        threads.set_threads(&[1]);
        let walker = FakeWalker {
            frames: vec!["a", "b"],
            fail_for: None,
        };
        let (mut sampler, recorded) = sampler(0, &threads, walker);

        assert_eq!(sampler.sample(), 1);
        let recorded = recorded.borrow();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].stack_depth, 0);
    }

    #[test]
    fn sample_without_recorder_records_nothing() {
        let threads = FakeThreads::default();
        threads.set_threads(&[1, 2]);
        let mut sampler: Sampler<_, _, FakeRecorder> =
            Sampler::new(4, threads, FakeWalker::default()).unwrap();
        assert!(sampler.recorder().is_none());
        assert_eq!(sampler.sample(), 0);
        assert_eq!(sampler.tracked_threads(), 0);
    }

    #[test]
    fn contexts_accumulate_across_passes() {
        let threads = FakeThreads::default();
        threads.set_threads(&[1, 2]);
        let (mut sampler, _recorded) = sampler(4, &threads, FakeWalker::default());

        assert_eq!(sampler.sample(), 2);
        threads.set_threads(&[2, 3]);
        assert_eq!(sampler.sample(), 2);

        // key set equals the union of both enumerations
        let mut seen = Vec::new();
        sampler.visit_retained_threads(&mut |thread| seen.push(*thread));
        seen.sort();
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(sampler.tracked_threads(), 3);
    }

    #[test]
    fn walker_failure_skips_only_that_thread() {
        let threads = FakeThreads::default();
        threads.set_threads(&[1, 2, 3]);
        let walker = FakeWalker {
            frames: vec!["work"],
            fail_for: Some(2),
        };
        let (mut sampler, recorded) = sampler(4, &threads, walker);

        assert_eq!(sampler.sample(), 2);
        let recorded = recorded.borrow();
        let sampled: Vec<u32> = recorded.iter().map(|sample| sample.thread).collect();
        assert_eq!(sampled, vec![1, 3]);
        // the skipped thread still got a context
        assert_eq!(sampler.tracked_threads(), 3);
    }

    #[test]
    fn metric_deltas_are_computed_between_sightings() {
        let threads = FakeThreads::default();
        threads.set_threads(&[1]);
        threads.set_cpu(1, 1_000);
        let (mut sampler, recorded) = sampler(4, &threads, FakeWalker::default());

        assert_eq!(sampler.sample(), 1);
        threads.set_cpu(1, 5_000);
        threads.advance_wall(2_000);
        assert_eq!(sampler.sample(), 1);

        let recorded = recorded.borrow();
        let first = &recorded[0].values;
        let second = &recorded[1].values;
        assert_eq!(first[MetricColumn::CpuTime.index()], 0);
        assert_eq!(first[MetricColumn::WallTime.index()], 0);
        assert_eq!(first[MetricColumn::CpuSamples.index()], 1);
        assert_eq!(second[MetricColumn::CpuTime.index()], 4_000);
        assert_eq!(second[MetricColumn::WallTime.index()], 2_000);
        assert_eq!(second[MetricColumn::CpuSamples.index()], 1);
        assert_eq!(recorded[0].labels, 0);
    }

    #[test]
    fn missing_cpu_clock_reads_zero() {
        let threads = FakeThreads::default();
        threads.set_threads(&[1]);
        let (mut sampler, recorded) = sampler(4, &threads, FakeWalker::default());

        sampler.sample();
        threads.advance_wall(500);
        sampler.sample();

        let recorded = recorded.borrow();
        assert_eq!(recorded[1].values[MetricColumn::CpuTime.index()], 0);
        assert_eq!(recorded[1].values[MetricColumn::WallTime.index()], 500);
    }

    #[test]
    fn thread_list_matches_the_enumerator() {
        let threads = FakeThreads::default();
        threads.set_threads(&[5, 6]);
        let (sampler, _recorded) = sampler(4, &threads, FakeWalker::default());
        assert_eq!(sampler.thread_list(), vec![5, 6]);
    }

    #[test]
    fn exited_threads_are_evicted_on_notification() {
        let threads = FakeThreads::default();
        threads.set_threads(&[1, 2]);
        let (mut sampler, _recorded) = sampler(4, &threads, FakeWalker::default());
        sampler.sample();

        assert!(sampler.on_thread_exited(&1));
        assert!(!sampler.on_thread_exited(&1));
        assert_eq!(sampler.tracked_threads(), 1);
    }

    #[test]
    fn inspect_is_a_pure_function_of_state() {
        let build = || {
            let threads = FakeThreads::default();
            threads.set_threads(&[2, 1]);
            let (mut sampler, _recorded) = sampler(4, &threads, FakeWalker::default());
            sampler.sample();
            sampler
        };
        let first = build();
        let second = build();
        assert_eq!(first.inspect(), second.inspect());
        assert_eq!(first.inspect(), first.inspect());
        assert!(first.inspect().contains("recorder=bound"));
    }
}
