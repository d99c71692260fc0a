//! Transfer engine binding.
//!
//! Turns one [`PendingRequest`] into a configured libcurl easy handle whose
//! [`ResponseSink`] collects the response while the multiplexer drives it.

#![allow(unsafe_code)]

use crate::error::EngineError;
use courier_core::{HttpMethod, PendingRequest, ResponseHeaders, VERSION};
use curl::easy::{Easy2, Handler, List, WriteError};
use curl::multi::Easy2Handle;
use curl_sys::{CURLOPT_PROTOCOLS, CURLOPT_REDIR_PROTOCOLS, CURLPROTO_HTTP, CURLPROTO_HTTPS};
use std::time::Duration;

/// Per-transfer options that come from configuration rather than the row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferOptions {
    /// Turn on libcurl's verbose trace (written to stderr)
    pub verbose: bool,
}

/// Response accumulator handed to libcurl.
///
/// Body chunks are appended as delivered. Header lines are parsed as they
/// arrive; a new status line discards the headers of an interim or
/// redirect response, so only the final response's headers remain.
#[derive(Debug, Default)]
pub struct ResponseSink {
    body: Vec<u8>,
    headers: ResponseHeaders,
}

impl ResponseSink {
    /// Body bytes received so far.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Headers of the current response block.
    #[must_use]
    pub const fn headers(&self) -> &ResponseHeaders {
        &self.headers
    }

    /// Move the body out, leaving the sink empty.
    pub fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }

    /// Move the headers out, leaving the sink empty.
    pub fn take_headers(&mut self) -> ResponseHeaders {
        std::mem::take(&mut self.headers)
    }

    fn record_header_line(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches(['\r', '\n']);

        if line.starts_with("HTTP/") {
            self.headers.clear();
        } else if line.starts_with([' ', '\t']) {
            self.headers.continue_last(line.trim());
        } else if let Some((name, value)) = line.split_once(':') {
            self.headers.push(name.trim(), value.trim());
        }
    }
}

impl Handler for ResponseSink {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        self.body.extend_from_slice(data);
        Ok(data.len())
    }

    fn header(&mut self, data: &[u8]) -> bool {
        self.record_header_line(data);
        true
    }
}

/// One in-flight request, owned by the multiplexer's batch arena.
#[derive(Debug)]
pub struct TrackedTransfer {
    /// Request identifier
    pub id: i64,
    /// Method the request was sent with
    pub method: HttpMethod,
    /// Target URL
    pub url: String,
    /// Configured total timeout, kept for the timeout diagnostic
    pub timeout_milliseconds: i32,
    handle: Easy2Handle<ResponseSink>,
}

impl TrackedTransfer {
    pub(crate) fn new(request: &PendingRequest, handle: Easy2Handle<ResponseSink>) -> Self {
        Self {
            id: request.id,
            method: request.method,
            url: request.url.clone(),
            timeout_milliseconds: request.timeout_milliseconds,
            handle,
        }
    }

    /// The easy handle, still registered with the multi handle.
    pub(crate) fn easy_mut(&mut self) -> &mut Easy2<ResponseSink> {
        &mut self.handle
    }

    pub(crate) fn into_handle(self) -> Easy2Handle<ResponseSink> {
        self.handle
    }
}

/// The `User-Agent` header appended to every request.
#[must_use]
pub fn user_agent() -> String {
    format!("User-Agent: courier/{VERSION}")
}

/// Header lines sent for `request`: the caller's headers in order, then
/// the `User-Agent` line.
#[must_use]
pub fn request_headers(request: &PendingRequest) -> Vec<String> {
    let mut lines = Vec::with_capacity(request.headers.len() + 1);
    lines.extend(request.headers.iter().cloned());
    lines.push(user_agent());
    lines
}

/// Build the easy handle for `request`.
///
/// # Errors
///
/// Returns [`EngineError::Transfer`] if libcurl rejects an option. This is a
/// resource problem, not a property of the row, and aborts the batch.
pub fn create_transfer(
    request: &PendingRequest,
    options: TransferOptions,
) -> Result<Easy2<ResponseSink>, EngineError> {
    let mut easy = Easy2::new(ResponseSink::default());

    easy.url(&request.url)?;
    easy.signal(false)?;
    easy.verbose(options.verbose)?;

    let mut headers = List::new();
    for line in request_headers(request) {
        headers.append(&line)?;
    }
    easy.http_headers(headers)?;

    match (request.method, request.body.as_deref()) {
        (HttpMethod::Get, None) => easy.get(true)?,
        (HttpMethod::Get, Some(body)) => {
            easy.post_fields_copy(body.as_bytes())?;
            easy.custom_request("GET")?;
        }
        (HttpMethod::Post, Some(body)) => {
            easy.post(true)?;
            easy.post_fields_copy(body.as_bytes())?;
        }
        // Zero-length POST rather than a chunked upload.
        (HttpMethod::Post, None) => {
            easy.post(true)?;
            easy.post_field_size(0)?;
        }
        (HttpMethod::Delete, body) => {
            if let Some(body) = body {
                easy.post_fields_copy(body.as_bytes())?;
            }
            easy.custom_request("DELETE")?;
        }
    }

    if let Ok(ms) = u64::try_from(request.timeout_milliseconds) {
        if ms > 0 {
            easy.timeout(Duration::from_millis(ms))?;
        }
    }
    easy.follow_location(true)?;
    restrict_protocols(&easy)?;

    Ok(easy)
}

/// Allow only `http` and `https`, for the first request and for redirects.
fn restrict_protocols(easy: &Easy2<ResponseSink>) -> Result<(), curl::Error> {
    let allowed = libc::c_long::from(CURLPROTO_HTTP | CURLPROTO_HTTPS);
    for option in [CURLOPT_PROTOCOLS, CURLOPT_REDIR_PROTOCOLS] {
        // SAFETY: `easy.raw()` is a live easy handle owned by `easy`, and both
        // options take a `long` bitmask.
        let code = unsafe {
            curl_sys::curl_easy_setopt(easy.raw(), option, allowed)
        };
        if code != curl_sys::CURLE_OK {
            return Err(curl::Error::new(code));
        }
    }
    Ok(())
}
