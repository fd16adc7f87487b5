// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Extraction of the trace context carried in delivery headers, and creation of
//! the consumer span each delivery is processed under.

use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::Extractor,
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};

/// Reads OpenTelemetry context entries from delivery headers.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a BTreeMap<String, String>,
}

impl<'a> HeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Extractor for HeaderExtractor<'_> {
    /// Falls back to a case-insensitive match.
    fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .get(key)
            .or_else(|| {
                self.headers
                    .iter()
                    .find(|(header, _)| header.eq_ignore_ascii_case(key))
                    .map(|(_, value)| value)
            })
            .map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Creates a new consumer span for processing a delivery.
///
/// The returned context is the one propagated by the publisher, or an empty one.
pub fn new_span(
    headers: &BTreeMap<String, String>,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor::new(headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
