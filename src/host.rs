// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Interfaces the embedding host runtime provides to the agent core.
//!
//! The core never talks to the host runtime directly: thread enumeration,
//! the cooperative scheduling region, interrupt delivery, and the tag-failure
//! logging callback all arrive through the traits in this module.

use std::fmt;
use std::hash::Hash;

/// An asynchronous interrupt the host runtime wants delivered to the current
/// thread (shutdown, thread kill, timer). The core never inspects it; it
/// finishes releasing foreign resources, then hands the token back to the
/// embedding layer, which re-raises it in host terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostInterrupt {
    tag: i32,
}

impl HostInterrupt {
    /// Wraps a host-defined interrupt tag.
    pub fn new(tag: i32) -> Self {
        Self { tag }
    }

    /// The host-defined tag, as passed to [`HostInterrupt::new`].
    pub fn tag(self) -> i32 {
        self.tag
    }
}

/// Scheduling, interrupt, and logging services of the host runtime.
pub trait HostRuntime {
    /// Runs `blocking` outside the cooperative scheduling region, so other
    /// host threads can make progress while it is in flight.
    ///
    /// The call may return without having run `blocking` at all when an
    /// interrupt arrives first; callers must check for that and decide
    /// whether to retry. While `blocking` is in flight the host may invoke
    /// `unblock` from another thread; it must cause `blocking` to return
    /// promptly.
    fn call_without_scheduler_lock(&self, blocking: &mut dyn FnMut(), unblock: &(dyn Fn() + Sync));

    /// Checks whether the host has an interrupt queued for the current
    /// thread, without delivering it.
    fn pending_interrupt(&self) -> Option<HostInterrupt>;

    /// Reports a tag pair the exporter library refused. This calls back into
    /// host code, which may itself raise, signalled here as `Err`; the
    /// caller must release any in-flight foreign resources before
    /// propagating it.
    fn log_failure_to_process_tag(&self, details: &str) -> Result<(), HostInterrupt>;
}

/// Thread enumeration and clock access for the sampler.
pub trait HostThreads {
    /// Handle to a live host thread. Handles are compared and hashed to key
    /// the sampler's per-thread map, and must stay meaningful for as long as
    /// the host keeps the thread reachable.
    type Handle: Clone + Eq + Hash + fmt::Debug;

    /// Returns the threads that are live right now. The sampler snapshots
    /// this once per pass; threads appearing mid-pass are picked up on the
    /// next one.
    fn thread_list(&self) -> Vec<Self::Handle>;

    /// CPU time consumed by `thread` so far, in nanoseconds, or `None` when
    /// the platform exposes no per-thread CPU clock.
    fn cpu_time_ns(&self, thread: &Self::Handle) -> Option<i64>;

    /// A monotonic wall clock reading in nanoseconds. Only differences are
    /// meaningful.
    fn monotonic_wall_time_ns(&self) -> i64;
}
