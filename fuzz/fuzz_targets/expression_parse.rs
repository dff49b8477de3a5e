//! Subscription expression parsing and evaluation.
//!
//! Any UTF-8 input either parses or returns an error, and a parsed filter
//! can be evaluated against a fixed notification.

#![no_main]

use elvin_core::{BasicExpressions, ExpressionEngine};
use elvin_proto::Notification;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(source) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(filter) = BasicExpressions.parse(source) else {
        return;
    };
    let sample = Notification::new().with("Group", "eng").with("count", 7).with("ratio", 0.5);
    filter.evaluate(&sample);
    filter.attribute_names();
});
