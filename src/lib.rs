// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! ## In-process profiling agent core
//! The native core of a language-runtime profiling agent: a per-thread
//! CPU/wall-time sampler skeleton and a cancellable upload transport that
//! delivers completed profiles to an ingestion endpoint, either a local
//! collector agent or the cloud intake directly.
//!
//! ### Embedding
//!
//! The crate is runtime-agnostic: the embedding layer supplies the host
//! services as trait implementations ([`host::HostRuntime`],
//! [`host::HostThreads`], [`sample::Recorder`], [`sample::StackWalker`]) and
//! the core never calls the host behind their back. The network client is
//! the profile exporter library, loaded at runtime and driven through
//! [`exporter::ExporterEngine`].
//!
//! Uploads run outside the host's cooperative scheduling region so host
//! threads keep making progress during a slow network call, yet remain
//! interruptible: a host interrupt cancels the in-flight send, every
//! natively-allocated resource is released exactly once, and the interrupt
//! is handed back to the embedder afterwards.
//!
//! ```no_run
//! # use profiling_agent::exporter::NativeEngine;
//! # use profiling_agent::host::{HostInterrupt, HostRuntime};
//! # use profiling_agent::transport::{ExporterConfiguration, HttpTransport};
//! # struct Host;
//! # impl HostRuntime for Host {
//! #     fn call_without_scheduler_lock(
//! #         &self,
//! #         blocking: &mut dyn FnMut(),
//! #         _unblock: &(dyn Fn() + Sync),
//! #     ) {
//! #         blocking()
//! #     }
//! #     fn pending_interrupt(&self) -> Option<HostInterrupt> { None }
//! #     fn log_failure_to_process_tag(&self, _details: &str) -> Result<(), HostInterrupt> {
//! #         Ok(())
//! #     }
//! # }
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = HttpTransport::new(NativeEngine::load()?, Host);
//! let configuration = ExporterConfiguration::with_agent("http://127.0.0.1:8126");
//! transport.validate(&configuration)?;
//! # Ok(())
//! # }
//! ```
//!
//! The sampler side is driven by the embedder at its own cadence: one
//! [`sampler::Sampler::sample`] call performs one pass over the live host
//! threads and forwards an emission per thread to the bound recorder.
//!
//! What this crate deliberately does not contain: stack-walking internals,
//! payload encoding (profiles arrive as pre-encoded blobs), symbol
//! resolution, and the scheduling glue that decides when to sample or
//! upload. Those live in the embedding layer.

pub mod exporter;
pub mod host;
pub mod sample;
pub mod sampler;
pub mod transport;
