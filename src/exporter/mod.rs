// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The profile exporter library seam.
//!
//! The transport talks to the cancellable HTTP exporter through the
//! [`ExporterEngine`] trait so that the foreign library can be swapped out in
//! tests. Every foreign object is modeled as a move-only owning handle: its
//! destructor performs the single permitted release, and transferring it into
//! a builder (or into [`ExporterEngine::send`]) consumes it.

use std::ffi::c_char;
use std::sync::Arc;

use thiserror::Error;

pub(crate) mod raw;

/// POSIX-style `(seconds, nanoseconds)` pair used for the profiled window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timespec {
    /// Whole seconds since the Unix epoch.
    pub seconds: i64,
    /// Nanosecond remainder, `0..1_000_000_000`.
    pub nanoseconds: u32,
}

/// Where a profile gets submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint<'a> {
    /// Submission through a local collector agent.
    Agent {
        /// Base URL of the agent, e.g. `http://127.0.0.1:8126`.
        base_url: &'a str,
    },
    /// Direct submission to the cloud intake.
    Agentless {
        /// Intake site host name.
        site: &'a str,
        /// API key authorizing the submission.
        api_key: &'a str,
    },
}

/// A named blob attached to an upload. The endpoint identifies attachments
/// by name; both fields borrow the caller's storage for the duration of the
/// call.
#[derive(Debug, Clone, Copy)]
pub struct RequestFile<'a> {
    /// Attachment name, arbitrary UTF-8.
    pub name: &'a str,
    /// Pre-encoded attachment contents.
    pub bytes: &'a [u8],
}

/// What came back from a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The endpoint answered; any status code counts as an HTTP response.
    HttpResponse(u16),
    /// No HTTP response: connection failure, timeout, or cancellation.
    Failure(String),
}

/// Interface of the cancellable profile exporter library.
///
/// Implementations own the actual network client. The production
/// implementation is [`NativeEngine`]; tests substitute mocks that count
/// constructions and releases.
pub trait ExporterEngine: Sync {
    /// Tag vector under construction. Dropping it releases it; passing it to
    /// [`ExporterEngine::new_exporter`] consumes it.
    type Tags: Send;
    /// A ready-to-use exporter. Dropping it releases it.
    type Exporter: Send;
    /// A built upload request. Deliberately has no destructor: it must be
    /// consumed by [`ExporterEngine::send`] (see the transport's cancellation
    /// handling for the only other way it is disposed of).
    type Request: Send;
    /// One-shot cancellation token shared with an in-flight send.
    type Cancellation: Send + Sync;

    /// Creates an empty tag vector.
    fn new_tags(&self) -> Self::Tags;

    /// Pushes one `(name, value)` pair. On rejection the vector is unchanged
    /// and still valid; the returned message describes why the pair was
    /// refused.
    fn push_tag(&self, tags: &mut Self::Tags, name: &str, value: &str) -> Result<(), String>;

    /// Builds an exporter for `endpoint`, consuming the tag vector whether or
    /// not construction succeeds.
    fn new_exporter(
        &self,
        endpoint: Endpoint<'_>,
        tags: Self::Tags,
    ) -> Result<Self::Exporter, String>;

    /// Creates a fresh cancellation token.
    fn new_cancellation(&self) -> Self::Cancellation;

    /// Signals the token. May be called from any thread, any number of
    /// times; an in-flight send observing it must return promptly.
    fn cancel(&self, token: &Self::Cancellation);

    /// Packages one upload: profiled window, 1..2 named files, optional
    /// additional tags, and the send timeout (forwarded verbatim).
    fn build_request(
        &self,
        exporter: &mut Self::Exporter,
        start: Timespec,
        finish: Timespec,
        files: &[RequestFile<'_>],
        additional_tags: Option<&Self::Tags>,
        timeout_ms: u64,
    ) -> Self::Request;

    /// Performs the blocking send, consuming the request. The engine owns the
    /// request from here on, including when the token was already signalled,
    /// in which case the send disposes of it and returns a failure outcome
    /// immediately.
    fn send(
        &self,
        exporter: &mut Self::Exporter,
        request: Self::Request,
        cancellation: &Self::Cancellation,
    ) -> SendOutcome;
}

/// The exporter library could not be loaded or is missing symbols.
#[derive(Debug, Clone, Error)]
#[error("error loading the profile exporter library: {0}")]
pub struct ExporterLoadError(#[from] Arc<libloading::Error>);

const PROFILING_LIBRARY_NAME: &str = env!("CARGO_PKG_NAME");
const PROFILING_LIBRARY_VERSION: &str = env!("CARGO_PKG_VERSION");
const PROFILE_FAMILY: &str = "native";

/// Owned tag vector backed by the exporter library.
pub struct NativeTags {
    raw: raw::ddog_Vec_Tag,
    bindings: &'static raw::ExporterBindings,
}

// safety: the vector is an owned heap value; the library does not pin it to
// the creating thread.
unsafe impl Send for NativeTags {}

impl Drop for NativeTags {
    fn drop(&mut self) {
        unsafe { (self.bindings.ddog_Vec_Tag_drop)(self.raw) }
    }
}

/// Owned exporter handle backed by the exporter library.
pub struct NativeExporter {
    ptr: *mut raw::ddog_prof_Exporter,
    bindings: &'static raw::ExporterBindings,
}

// safety: the library allows handing the exporter across threads as long as
// it is used from one thread at a time, which &mut enforces.
unsafe impl Send for NativeExporter {}

impl Drop for NativeExporter {
    fn drop(&mut self) {
        unsafe { (self.bindings.ddog_prof_Exporter_drop)(self.ptr) }
    }
}

/// Built request handle. No destructor: the library reclaims it inside
/// `send`, and provides no other way to dispose of it.
pub struct NativeRequest {
    ptr: *mut raw::ddog_prof_Request,
}

// safety: the request is inert until handed to send.
unsafe impl Send for NativeRequest {}

/// Owned cancellation token backed by the exporter library.
pub struct NativeCancellation {
    ptr: *mut raw::ddog_CancellationToken,
    bindings: &'static raw::ExporterBindings,
}

// safety: the library documents the token as safe to signal from any thread
// concurrently with the send that watches it.
unsafe impl Send for NativeCancellation {}
unsafe impl Sync for NativeCancellation {}

impl Drop for NativeCancellation {
    fn drop(&mut self) {
        unsafe { (self.bindings.ddog_CancellationToken_drop)(self.ptr) }
    }
}

/// [`ExporterEngine`] implementation over the dynamically loaded exporter
/// library.
#[derive(Clone, Copy)]
pub struct NativeEngine {
    bindings: &'static raw::ExporterBindings,
}

impl NativeEngine {
    /// Binds the exporter library, loading it on first use. The library and
    /// any load failure are memoised for the lifetime of the process.
    pub fn load() -> Result<Self, ExporterLoadError> {
        Ok(Self {
            bindings: raw::exporter_bindings()?,
        })
    }
}

fn char_slice(s: &str) -> raw::ddog_CharSlice {
    raw::ddog_CharSlice {
        ptr: s.as_ptr().cast::<c_char>(),
        len: s.len(),
    }
}

fn byte_slice(bytes: &[u8]) -> raw::ddog_ByteSlice {
    raw::ddog_ByteSlice {
        ptr: bytes.as_ptr(),
        len: bytes.len(),
    }
}

// Copies the library-owned byte vector into a host string, then releases the
// vector. This is the only place an owned foreign vector crosses into Rust.
fn string_from_vec_u8(bindings: &'static raw::ExporterBindings, vec: raw::ddog_Vec_U8) -> String {
    let copied = if vec.ptr.is_null() || vec.len == 0 {
        String::new()
    } else {
        // safety: the library hands back an initialized buffer of `len` bytes
        let bytes = unsafe { std::slice::from_raw_parts(vec.ptr, vec.len) };
        String::from_utf8_lossy(bytes).into_owned()
    };
    unsafe { (bindings.ddog_Vec_U8_drop)(vec) };
    copied
}

impl ExporterEngine for NativeEngine {
    type Tags = NativeTags;
    type Exporter = NativeExporter;
    type Request = NativeRequest;
    type Cancellation = NativeCancellation;

    fn new_tags(&self) -> NativeTags {
        NativeTags {
            raw: unsafe { (self.bindings.ddog_Vec_Tag_new)() },
            bindings: self.bindings,
        }
    }

    fn push_tag(&self, tags: &mut NativeTags, name: &str, value: &str) -> Result<(), String> {
        let result = unsafe {
            (self.bindings.ddog_Vec_Tag_push)(&mut tags.raw, char_slice(name), char_slice(value))
        };
        match result.tag {
            raw::ddog_PushTagResultTag::Ok => Ok(()),
            raw::ddog_PushTagResultTag::Err => {
                Err(string_from_vec_u8(self.bindings, result.err))
            }
        }
    }

    fn new_exporter(
        &self,
        endpoint: Endpoint<'_>,
        tags: NativeTags,
    ) -> Result<NativeExporter, String> {
        let raw_endpoint = match endpoint {
            Endpoint::Agent { base_url } => raw::ddog_prof_Endpoint {
                tag: raw::ddog_prof_EndpointTag::Agent,
                body: raw::ddog_prof_EndpointBody {
                    agent: char_slice(base_url),
                },
            },
            Endpoint::Agentless { site, api_key } => raw::ddog_prof_Endpoint {
                tag: raw::ddog_prof_EndpointTag::Agentless,
                body: raw::ddog_prof_EndpointBody {
                    agentless: raw::ddog_prof_EndpointAgentless {
                        site: char_slice(site),
                        api_key: char_slice(api_key),
                    },
                },
            },
        };

        // the builder copies what it needs out of the tag vector, which is
        // released when `tags` drops on return
        let result = unsafe {
            (self.bindings.ddog_prof_Exporter_new)(
                char_slice(PROFILING_LIBRARY_NAME),
                char_slice(PROFILING_LIBRARY_VERSION),
                char_slice(PROFILE_FAMILY),
                &tags.raw,
                raw_endpoint,
            )
        };
        drop(tags);

        match result.tag {
            raw::ddog_prof_Exporter_NewResultTag::Ok => Ok(NativeExporter {
                // safety: tag was checked
                ptr: unsafe { result.body.ok },
                bindings: self.bindings,
            }),
            raw::ddog_prof_Exporter_NewResultTag::Err => Err(string_from_vec_u8(self.bindings, {
                // safety: tag was checked
                unsafe { result.body.err }
            })),
        }
    }

    fn new_cancellation(&self) -> NativeCancellation {
        NativeCancellation {
            ptr: unsafe { (self.bindings.ddog_CancellationToken_new)() },
            bindings: self.bindings,
        }
    }

    fn cancel(&self, token: &NativeCancellation) {
        unsafe { (self.bindings.ddog_CancellationToken_cancel)(token.ptr) }
    }

    fn build_request(
        &self,
        exporter: &mut NativeExporter,
        start: Timespec,
        finish: Timespec,
        files: &[RequestFile<'_>],
        additional_tags: Option<&NativeTags>,
        timeout_ms: u64,
    ) -> NativeRequest {
        let raw_files: Vec<raw::ddog_prof_File> = files
            .iter()
            .map(|file| raw::ddog_prof_File {
                name: char_slice(file.name),
                file: byte_slice(file.bytes),
            })
            .collect();

        let ptr = unsafe {
            (self.bindings.ddog_prof_Exporter_Request_build)(
                exporter.ptr,
                raw::ddog_Timespec {
                    seconds: start.seconds,
                    nanoseconds: start.nanoseconds,
                },
                raw::ddog_Timespec {
                    seconds: finish.seconds,
                    nanoseconds: finish.nanoseconds,
                },
                raw::ddog_prof_Slice_File {
                    ptr: raw_files.as_ptr(),
                    len: raw_files.len(),
                },
                additional_tags.map_or(std::ptr::null(), |tags| &tags.raw as *const _),
                timeout_ms,
            )
        };

        NativeRequest { ptr }
    }

    fn send(
        &self,
        exporter: &mut NativeExporter,
        request: NativeRequest,
        cancellation: &NativeCancellation,
    ) -> SendOutcome {
        let result = unsafe {
            (self.bindings.ddog_prof_Exporter_send)(exporter.ptr, request.ptr, cancellation.ptr)
        };
        match result.tag {
            raw::ddog_prof_SendResultTag::HttpResponse => {
                // safety: tag was checked
                SendOutcome::HttpResponse(unsafe { result.body.http_response }.code)
            }
            raw::ddog_prof_SendResultTag::Failure => SendOutcome::Failure(string_from_vec_u8(
                self.bindings,
                // safety: tag was checked
                unsafe { result.body.failure },
            )),
        }
    }
}
