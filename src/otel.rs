// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels in the string headers of each message. The publisher injects
//! the current context, the consumer extracts it and opens a consumer span per message.

use crate::broker::Headers;
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{Span, SpanKind, Status, Tracer},
    Context,
};
use std::borrow::Cow;

/// Writes trace context entries into message headers.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut Headers,
}

impl<'a> HeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut Headers) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

/// Reads trace context entries from message headers.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a Headers,
}

impl<'a> HeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a Headers) -> Self {
        Self { headers }
    }
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Injects `ctx` into `headers` with the global propagator.
pub fn inject(ctx: &Context, headers: &mut Headers) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderInjector::new(headers))
    });
}

/// Extracts the parent context from `headers` and starts a consumer span named `name`.
pub fn new_span(headers: &Headers, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor::new(headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

/// Marks the span status from a processing outcome.
pub fn record_outcome(span: &mut BoxedSpan, outcome: Result<(), &dyn std::error::Error>) {
    match outcome {
        Ok(()) => span.set_status(Status::Ok),
        Err(err) => {
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injector_lowercases_keys() {
        let mut headers = Headers::new();
        HeaderInjector::new(&mut headers).set("TraceParent", "00-abc-def-01".to_owned());

        assert_eq!(
            headers.get("traceparent").map(String::as_str),
            Some("00-abc-def-01")
        );
    }

    #[test]
    fn extractor_reads_headers() {
        let mut headers = Headers::new();
        headers.insert("traceparent".to_owned(), "00-abc-def-01".to_owned());
        headers.insert("tracestate".to_owned(), "vendor=1".to_owned());

        let extractor = HeaderExtractor::new(&headers);
        let mut keys = extractor.keys();
        keys.sort();

        assert_eq!(extractor.get("tracestate"), Some("vendor=1"));
        assert_eq!(extractor.get("missing"), None);
        assert_eq!(keys, vec!["traceparent", "tracestate"]);
    }

    #[test]
    fn spans_start_without_parent_headers() {
        let tracer = global::tracer("msgqueue-test");
        let (_ctx, mut span) = new_span(&Headers::new(), &tracer, "test_message");

        record_outcome(&mut span, Ok(()));
        span.end();
    }
}
