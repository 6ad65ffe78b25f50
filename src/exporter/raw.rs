// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

// Hand-written bindings for the profile exporter surface of the
// libdatadog profiling C API (datadog/profiling.h). Type and symbol names
// mirror the C header.
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
// result variants only ever arrive from the library side
#![allow(dead_code)]

use std::ffi::{c_char, c_void};
use std::sync::{Arc, LazyLock};

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct ddog_CharSlice {
    pub ptr: *const c_char,
    pub len: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct ddog_ByteSlice {
    pub ptr: *const u8,
    pub len: usize,
}

// Owned by the library; must be returned to it through ddog_Vec_U8_drop.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct ddog_Vec_U8 {
    pub ptr: *const u8,
    pub len: usize,
    pub capacity: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct ddog_Vec_Tag {
    pub ptr: *const c_void,
    pub len: usize,
    pub capacity: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct ddog_Timespec {
    pub seconds: i64,
    pub nanoseconds: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct ddog_prof_File {
    pub name: ddog_CharSlice,
    pub file: ddog_ByteSlice,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct ddog_prof_Slice_File {
    pub ptr: *const ddog_prof_File,
    pub len: usize,
}

#[repr(C)]
pub(crate) struct ddog_prof_Exporter {
    _opaque: [u8; 0],
}

#[repr(C)]
pub(crate) struct ddog_prof_Request {
    _opaque: [u8; 0],
}

#[repr(C)]
pub(crate) struct ddog_CancellationToken {
    _opaque: [u8; 0],
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum ddog_prof_EndpointTag {
    Agent = 0,
    Agentless = 1,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct ddog_prof_EndpointAgentless {
    pub site: ddog_CharSlice,
    pub api_key: ddog_CharSlice,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) union ddog_prof_EndpointBody {
    pub agent: ddog_CharSlice,
    pub agentless: ddog_prof_EndpointAgentless,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct ddog_prof_Endpoint {
    pub tag: ddog_prof_EndpointTag,
    pub body: ddog_prof_EndpointBody,
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum ddog_PushTagResultTag {
    Ok = 0,
    Err = 1,
}

// `err` is only initialized when `tag` is Err.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct ddog_PushTagResult {
    pub tag: ddog_PushTagResultTag,
    pub err: ddog_Vec_U8,
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum ddog_prof_Exporter_NewResultTag {
    Ok = 0,
    Err = 1,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) union ddog_prof_Exporter_NewResultBody {
    pub ok: *mut ddog_prof_Exporter,
    pub err: ddog_Vec_U8,
}

#[repr(C)]
pub(crate) struct ddog_prof_Exporter_NewResult {
    pub tag: ddog_prof_Exporter_NewResultTag,
    pub body: ddog_prof_Exporter_NewResultBody,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct ddog_HttpStatus {
    pub code: u16,
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum ddog_prof_SendResultTag {
    HttpResponse = 0,
    Failure = 1,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) union ddog_prof_SendResultBody {
    pub http_response: ddog_HttpStatus,
    pub failure: ddog_Vec_U8,
}

#[repr(C)]
pub(crate) struct ddog_prof_SendResult {
    pub tag: ddog_prof_SendResultTag,
    pub body: ddog_prof_SendResultBody,
}

pub(crate) struct ExporterBindings {
    pub(crate) ddog_Vec_Tag_new: libloading::Symbol<'static, unsafe extern "C" fn() -> ddog_Vec_Tag>,
    pub(crate) ddog_Vec_Tag_push: libloading::Symbol<
        'static,
        unsafe extern "C" fn(*mut ddog_Vec_Tag, ddog_CharSlice, ddog_CharSlice) -> ddog_PushTagResult,
    >,
    pub(crate) ddog_Vec_Tag_drop: libloading::Symbol<'static, unsafe extern "C" fn(ddog_Vec_Tag)>,
    pub(crate) ddog_Vec_U8_drop: libloading::Symbol<'static, unsafe extern "C" fn(ddog_Vec_U8)>,
    pub(crate) ddog_prof_Exporter_new: libloading::Symbol<
        'static,
        unsafe extern "C" fn(
            ddog_CharSlice,
            ddog_CharSlice,
            ddog_CharSlice,
            *const ddog_Vec_Tag,
            ddog_prof_Endpoint,
        ) -> ddog_prof_Exporter_NewResult,
    >,
    pub(crate) ddog_prof_Exporter_drop:
        libloading::Symbol<'static, unsafe extern "C" fn(*mut ddog_prof_Exporter)>,
    pub(crate) ddog_prof_Exporter_Request_build: libloading::Symbol<
        'static,
        unsafe extern "C" fn(
            *mut ddog_prof_Exporter,
            ddog_Timespec,
            ddog_Timespec,
            ddog_prof_Slice_File,
            *const ddog_Vec_Tag,
            u64,
        ) -> *mut ddog_prof_Request,
    >,
    pub(crate) ddog_prof_Exporter_send: libloading::Symbol<
        'static,
        unsafe extern "C" fn(
            *mut ddog_prof_Exporter,
            *mut ddog_prof_Request,
            *mut ddog_CancellationToken,
        ) -> ddog_prof_SendResult,
    >,
    pub(crate) ddog_CancellationToken_new:
        libloading::Symbol<'static, unsafe extern "C" fn() -> *mut ddog_CancellationToken>,
    pub(crate) ddog_CancellationToken_cancel:
        libloading::Symbol<'static, unsafe extern "C" fn(*mut ddog_CancellationToken)>,
    pub(crate) ddog_CancellationToken_drop:
        libloading::Symbol<'static, unsafe extern "C" fn(*mut ddog_CancellationToken)>,
}

// make sure the exporter library is dlopen'd from a static, to avoid it being
// dlclose'd while exporters or in-flight requests still point into it.
static EXPORTER_LIB: LazyLock<Result<libloading::Library, Arc<libloading::Error>>> =
    LazyLock::new(|| Ok(unsafe { libloading::Library::new("libdatadog_profiling.so")? }));

// this needs to be a separate static from EXPORTER_LIB to avoid
// lifetime issues.
static EXPORTER_BINDINGS: LazyLock<Result<ExporterBindings, Arc<libloading::Error>>> =
    LazyLock::new(|| {
        // safety: correct use of dlopen
        unsafe {
            let lib = EXPORTER_LIB.as_ref().map_err(|e| e.clone())?;
            Ok(ExporterBindings {
                ddog_Vec_Tag_new: lib.get(b"ddog_Vec_Tag_new")?,
                ddog_Vec_Tag_push: lib.get(b"ddog_Vec_Tag_push")?,
                ddog_Vec_Tag_drop: lib.get(b"ddog_Vec_Tag_drop")?,
                ddog_Vec_U8_drop: lib.get(b"ddog_Vec_U8_drop")?,
                ddog_prof_Exporter_new: lib.get(b"ddog_prof_Exporter_new")?,
                ddog_prof_Exporter_drop: lib.get(b"ddog_prof_Exporter_drop")?,
                ddog_prof_Exporter_Request_build: lib.get(b"ddog_prof_Exporter_Request_build")?,
                ddog_prof_Exporter_send: lib.get(b"ddog_prof_Exporter_send")?,
                ddog_CancellationToken_new: lib.get(b"ddog_CancellationToken_new")?,
                ddog_CancellationToken_cancel: lib.get(b"ddog_CancellationToken_cancel")?,
                ddog_CancellationToken_drop: lib.get(b"ddog_CancellationToken_drop")?,
            })
        }
    });

pub(crate) fn exporter_bindings() -> Result<&'static ExporterBindings, Arc<libloading::Error>> {
    EXPORTER_BINDINGS.as_ref().map_err(|e| e.clone())
}
