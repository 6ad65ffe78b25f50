// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cancellable upload of completed profiles.
//!
//! [`HttpTransport`] packages one profiling payload (one or two named blobs
//! plus window timestamps and tags) and delivers it through the exporter
//! library, leaving the host's cooperative scheduling region for the duration
//! of the network call so host threads keep running, while staying
//! interruptible through the host's asynchronous interrupts.
//!
//! Outcome mapping for embedders: `Ok(status)` is the `(ok, http_status)`
//! pair; [`UploadError::ExporterSetup`] and [`UploadError::Send`] are the
//! `(error, message)` pair; [`UploadError::InvalidArgument`] should be raised
//! as the host's argument error; [`UploadError::Interrupted`] means every
//! foreign resource has been released and the host's pending interrupt must
//! now be delivered instead of any result.

use thiserror::Error;

use crate::exporter::{Endpoint, ExporterEngine, RequestFile, SendOutcome, Timespec};
use crate::host::{HostInterrupt, HostRuntime};

/// The transport's working mode and the settings that come with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExporterConfiguration {
    /// Direct submission to the cloud intake.
    Agentless {
        /// Intake site host name.
        site: String,
        /// API key authorizing the submission.
        api_key: String,
    },
    /// Submission through a local collector agent.
    WithAgent {
        /// Base URL of the agent.
        base_url: String,
    },
}

impl ExporterConfiguration {
    /// Direct-to-intake configuration.
    pub fn agentless(site: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self::Agentless {
            site: site.into(),
            api_key: api_key.into(),
        }
    }

    /// Via-agent configuration.
    pub fn with_agent(base_url: impl Into<String>) -> Self {
        Self::WithAgent {
            base_url: base_url.into(),
        }
    }

    /// Parses the positional configuration shape handed over by embedders:
    /// `["agentless", site, api_key]` or `["agent", base_url]`. Any other
    /// shape is an argument error.
    pub fn from_positional(parts: &[&str]) -> Result<Self, ArgumentError> {
        let configuration = match parts {
            ["agentless", site, api_key] => Self::agentless(*site, *api_key),
            ["agentless", ..] => {
                return Err(ArgumentError::MalformedConfiguration { mode: "agentless" })
            }
            ["agent", base_url] => Self::with_agent(*base_url),
            ["agent", ..] => return Err(ArgumentError::MalformedConfiguration { mode: "agent" }),
            [mode, ..] => {
                return Err(ArgumentError::UnexpectedWorkingMode {
                    mode: (*mode).to_string(),
                })
            }
            [] => {
                return Err(ArgumentError::UnexpectedWorkingMode {
                    mode: String::new(),
                })
            }
        };
        configuration.endpoint()?;
        Ok(configuration)
    }

    /// Validates the configuration and borrows it as an [`Endpoint`].
    pub fn endpoint(&self) -> Result<Endpoint<'_>, ArgumentError> {
        match self {
            Self::Agentless { site, api_key } => {
                if site.is_empty() {
                    return Err(ArgumentError::EmptyField { field: "site" });
                }
                if api_key.is_empty() {
                    return Err(ArgumentError::EmptyField { field: "api_key" });
                }
                Ok(Endpoint::Agentless { site, api_key })
            }
            Self::WithAgent { base_url } => {
                if base_url.is_empty() {
                    return Err(ArgumentError::EmptyField { field: "base_url" });
                }
                Ok(Endpoint::Agent { base_url })
            }
        }
    }
}

/// One profile upload: the profiled window, the encoded profile, the optional
/// provenance attachment, and the send timeout.
#[derive(Debug, Clone, Copy)]
pub struct UploadRequest<'a> {
    /// Start of the profiled window.
    pub start: Timespec,
    /// End of the profiled window.
    pub finish: Timespec,
    /// The encoded profile blob.
    pub pprof: RequestFile<'a>,
    /// Optional provenance attachment; carries both name and bytes, so the
    /// two are present or absent together.
    pub code_provenance: Option<RequestFile<'a>>,
    /// Send timeout in milliseconds, forwarded verbatim to the exporter
    /// library. The transport adds no timeout of its own.
    pub timeout_ms: u64,
}

/// Shape or value violations in configuration or call arguments, detected
/// before anything foreign is allocated. Embedders raise these as the host's
/// argument error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ArgumentError {
    /// The working-mode tag was neither `agentless` nor `agent`.
    #[error("failed to initialize transport: unexpected working mode {mode:?}, expected \"agentless\" or \"agent\"")]
    UnexpectedWorkingMode {
        /// The rejected tag.
        mode: String,
    },
    /// The positional configuration had the wrong number of fields for its
    /// working mode.
    #[error("failed to initialize transport: malformed {mode} configuration")]
    MalformedConfiguration {
        /// The working mode whose shape was violated.
        mode: &'static str,
    },
    /// A required configuration string was empty.
    #[error("failed to initialize transport: {field} must not be empty")]
    EmptyField {
        /// Name of the offending field.
        field: &'static str,
    },
}

/// Why a validate or upload call did not produce an HTTP status.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    /// Malformed configuration or arguments; nothing foreign was allocated.
    #[error(transparent)]
    InvalidArgument(#[from] ArgumentError),
    /// The exporter builder rejected the configuration.
    #[error("{0}")]
    ExporterSetup(String),
    /// The send finished without an HTTP response (connection failure,
    /// timeout, cancellation).
    #[error("{0}")]
    Send(String),
    /// A host interrupt arrived; every foreign resource has been released and
    /// the interrupt must now be delivered by the embedder.
    #[error("upload interrupted by the host runtime")]
    Interrupted(HostInterrupt),
}

enum SendExit {
    Completed(SendOutcome),
    Interrupted(HostInterrupt),
}

/// Uploads completed profiles through an [`ExporterEngine`].
pub struct HttpTransport<E, H> {
    engine: E,
    host: H,
}

impl<E: ExporterEngine, H: HostRuntime> HttpTransport<E, H> {
    /// Creates a transport over the given engine and host runtime.
    pub fn new(engine: E, host: H) -> Self {
        Self { engine, host }
    }

    /// Surfaces configuration errors synchronously: builds an exporter with
    /// an empty tag vector and immediately releases it.
    pub fn validate(&self, configuration: &ExporterConfiguration) -> Result<(), UploadError> {
        let exporter = self.build_exporter(configuration, &[])?;
        drop(exporter);
        Ok(())
    }

    /// Uploads exactly one profile and returns the HTTP status the endpoint
    /// answered with.
    ///
    /// Individually invalid tags are reported through the host logging
    /// callback and dropped; the upload proceeds without them. A host
    /// interrupt during the send aborts it and surfaces as
    /// [`UploadError::Interrupted`] once everything foreign is released.
    pub fn export(
        &self,
        configuration: &ExporterConfiguration,
        upload: &UploadRequest<'_>,
        tags: &[(String, String)],
    ) -> Result<u16, UploadError> {
        let mut files = Vec::with_capacity(2);
        files.push(upload.pprof);
        if let Some(provenance) = upload.code_provenance {
            files.push(provenance);
        }

        if let (Some(start), Some(finish)) = (utc(upload.start), utc(upload.finish)) {
            tracing::debug!(%start, %finish, files = files.len(), "uploading profile");
        }

        let mut exporter = self.build_exporter(configuration, tags)?;
        let result = self.send_request(&mut exporter, upload, &files);
        drop(exporter);

        match &result {
            Ok(status) => tracing::debug!(status = *status, "profile accepted"),
            Err(err) => tracing::debug!(%err, "profile upload did not complete"),
        }
        result
    }

    fn build_exporter(
        &self,
        configuration: &ExporterConfiguration,
        tags: &[(String, String)],
    ) -> Result<E::Exporter, UploadError> {
        // endpoint problems must surface before anything foreign is allocated
        let endpoint = configuration.endpoint()?;
        let tag_vec = self.convert_tags(tags)?;
        self.engine
            .new_exporter(endpoint, tag_vec)
            .map_err(UploadError::ExporterSetup)
    }

    fn convert_tags(&self, tags: &[(String, String)]) -> Result<E::Tags, UploadError> {
        let mut tag_vec = self.engine.new_tags();
        for (name, value) in tags {
            if let Err(details) = self.engine.push_tag(&mut tag_vec, name, value) {
                // The library validates tags and may refuse pairs the caller
                // did not catch. Warn through the host callback and skip them.
                if let Err(interrupt) = self.host.log_failure_to_process_tag(&details) {
                    drop(tag_vec);
                    return Err(UploadError::Interrupted(interrupt));
                }
            }
        }
        Ok(tag_vec)
    }

    fn send_request(
        &self,
        exporter: &mut E::Exporter,
        upload: &UploadRequest<'_>,
        files: &[RequestFile<'_>],
    ) -> Result<u16, UploadError> {
        let engine = &self.engine;
        let cancellation = engine.new_cancellation();
        let mut request = Some(engine.build_request(
            exporter,
            upload.start,
            upload.finish,
            files,
            None,
            upload.timeout_ms,
        ));

        // The region call may return before the send even started when an
        // interrupt arrives; retry unless the host has an interrupt pending.
        let exit = loop {
            let mut completed = None;
            self.host.call_without_scheduler_lock(
                &mut || {
                    if let Some(in_flight) = request.take() {
                        completed = Some(engine.send(exporter, in_flight, &cancellation));
                    }
                },
                &|| engine.cancel(&cancellation),
            );
            if let Some(outcome) = completed {
                break SendExit::Completed(outcome);
            }
            if let Some(interrupt) = self.host.pending_interrupt() {
                break SendExit::Interrupted(interrupt);
            }
        };

        // an interrupt that arrived while the send was in flight still wins
        let exit = match exit {
            SendExit::Completed(outcome) => match self.host.pending_interrupt() {
                Some(interrupt) => SendExit::Interrupted(interrupt),
                None => SendExit::Completed(outcome),
            },
            interrupted => interrupted,
        };

        match exit {
            SendExit::Interrupted(interrupt) => {
                // The library has no standalone destructor for an unsent
                // request: cancel and run the send once more, so it disposes
                // of the request and returns immediately.
                if let Some(in_flight) = request.take() {
                    engine.cancel(&cancellation);
                    let _ = engine.send(exporter, in_flight, &cancellation);
                }
                drop(cancellation);
                Err(UploadError::Interrupted(interrupt))
            }
            SendExit::Completed(SendOutcome::HttpResponse(status)) => {
                drop(cancellation);
                Ok(status)
            }
            SendExit::Completed(SendOutcome::Failure(details)) => {
                drop(cancellation);
                Err(UploadError::Send(details))
            }
        }
    }
}

fn utc(time: Timespec) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::from_timestamp(time.seconds, time.nanoseconds)
}
