//! Payload Sanitization - Runs Before Scheduling
//!
//! Capacity limits apply to every job. Untrusted jobs additionally have
//! source lowered to IR, raw statements stripped and externally hosted icon
//! URLs removed, whatever the worker would do on its own.

use base64::Engine;
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::diagnostics::JobError;
use crate::ir::{ArgValue, BuilderIR, ElementKind, ElementValue};
use crate::payload::{BuilderPayload, Payload};

#[cfg(feature = "test-hooks")]
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "test-hooks")]
static SANITIZE_CALL_COUNT: AtomicU32 = AtomicU32::new(0);

#[cfg(feature = "test-hooks")]
pub fn get_sanitize_call_count() -> u32 {
    SANITIZE_CALL_COUNT.load(Ordering::SeqCst)
}

#[cfg(feature = "test-hooks")]
pub fn reset_sanitize_call_count() {
    SANITIZE_CALL_COUNT.store(0, Ordering::SeqCst);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_source_bytes: usize,
    pub max_elements: usize,
    pub max_audio_bytes: usize,
}

/// What sanitization removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizeReport {
    pub scripts_removed: usize,
    pub icons_removed: usize,
}

/// Check limits and, for untrusted jobs, rewrite the payload into its safe form.
pub fn sanitize(payload: Payload, trusted: bool, limits: &Limits) -> Result<(Payload, SanitizeReport), JobError> {
    #[cfg(feature = "test-hooks")]
    SANITIZE_CALL_COUNT.fetch_add(1, Ordering::SeqCst);

    let source_bytes = payload.source_bytes();
    if source_bytes > limits.max_source_bytes {
        return Err(JobError::capacity(format!(
            "Source is {} bytes; limit is {}",
            source_bytes, limits.max_source_bytes
        )));
    }

    let mut report = SanitizeReport::default();
    let payload = if trusted {
        payload
    } else {
        match payload {
            Payload::Source(source) => {
                let ir = crate::transpile::source_to_ir(&source.full_source())?.ir;
                Payload::Builder(BuilderPayload::new(strip(ir, &mut report)))
            }
            Payload::Builder(builder) => {
                builder.check_version()?;
                let (ir, _) = builder.into_ir()?;
                Payload::Builder(BuilderPayload::new(strip(ir, &mut report)))
            }
            other => other,
        }
    };

    if let Payload::Builder(builder) = &payload {
        check_ir(&builder.ir, limits)?;
    }
    if report != SanitizeReport::default() {
        info!(
            scripts_removed = report.scripts_removed,
            icons_removed = report.icons_removed,
            "sanitized untrusted payload"
        );
    }
    Ok((payload, report))
}

/// Remove raw scripts and externally hosted point icons.
pub(crate) fn strip(mut ir: BuilderIR, report: &mut SanitizeReport) -> BuilderIR {
    let before = ir.elements.len();
    ir.elements.retain(|e| e.kind != ElementKind::RawScript);
    report.scripts_removed += before - ir.elements.len();

    for element in ir.elements.iter_mut().filter(|e| e.kind == ElementKind::Point) {
        let external = element
            .args
            .get("icon")
            .and_then(ArgValue::literal)
            .is_some_and(is_external_icon);
        if external {
            element.args.remove("icon");
            report.icons_removed += 1;
        }
    }
    ir
}

/// An icon given as (or pointing to) an http(s) URL.
fn is_external_icon(icon: &Value) -> bool {
    let url = match icon {
        Value::String(s) => s.as_str(),
        Value::Object(o) => match o.get("icon_url").and_then(Value::as_str) {
            Some(u) => u,
            None => return false,
        },
        _ => return false,
    };
    Url::parse(url.trim())
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

fn check_ir(ir: &BuilderIR, limits: &Limits) -> Result<(), JobError> {
    if ir.elements.len() > limits.max_elements {
        return Err(JobError::capacity(format!(
            "{} elements; limit is {}",
            ir.elements.len(),
            limits.max_elements
        )));
    }
    for element in ir.elements.iter().filter(|e| e.kind == ElementKind::AudioTrack) {
        let ElementValue::Literal(Value::String(path)) = &element.value else {
            continue;
        };
        let Some(bytes) = embedded_audio_bytes(path)? else {
            continue;
        };
        debug!(bytes, "embedded audio");
        if bytes > limits.max_audio_bytes {
            return Err(JobError::capacity(format!(
                "Embedded audio is {} bytes; limit is {}",
                bytes, limits.max_audio_bytes
            )));
        }
    }
    Ok(())
}

/// Decoded size of a `data:...;base64,` URL, `None` for anything else.
fn embedded_audio_bytes(path: &str) -> Result<Option<usize>, JobError> {
    let Some(rest) = path.strip_prefix("data:") else {
        return Ok(None);
    };
    let Some((meta, data)) = rest.split_once(',') else {
        return Err(JobError::invalid_payload("Malformed data URL"));
    };
    if !meta.ends_with(";base64") {
        return Ok(Some(data.len()));
    }
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map(|bytes| Some(bytes.len()))
        .map_err(|e| JobError::invalid_payload(format!("Invalid base64 audio: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::ErrorKind;
    use crate::payload::{SourcePayload, TaskType};
    use serde_json::json;

    fn limits() -> Limits {
        Limits {
            max_source_bytes: 1024,
            max_elements: 3,
            max_audio_bytes: 4,
        }
    }

    fn builder_ir(payload: &Payload) -> &BuilderIR {
        match payload {
            Payload::Builder(b) => &b.ir,
            other => panic!("expected builder payload, got {:?}", other),
        }
    }

    #[test]
    fn test_untrusted_source_is_lowered_and_stripped() {
        let payload = Payload::Source(SourcePayload {
            code: "run_anything()\npoint(\"p\", [1, 2], icon=\"https://evil.example/x.png\")\ntext(\"t\", [0, 0])".into(),
            ..Default::default()
        });
        let (payload, report) = sanitize(payload, false, &limits()).unwrap();
        let ir = builder_ir(&payload);
        assert_eq!(report.scripts_removed, 1);
        assert_eq!(report.icons_removed, 1);
        assert_eq!(ir.elements.len(), 2);
        assert!(ir.elements[0].args.get("icon").is_none());
    }

    #[test]
    fn test_trusted_payload_untouched() {
        let payload = Payload::Source(SourcePayload {
            code: "run_anything()".into(),
            ..Default::default()
        });
        let (out, report) = sanitize(payload.clone(), true, &limits()).unwrap();
        assert_eq!(out, payload);
        assert_eq!(report, SanitizeReport::default());
    }

    #[test]
    fn test_icon_kinds() {
        assert!(is_external_icon(&json!("http://a.b/c.png")));
        assert!(is_external_icon(&json!({"type": "url", "icon_url": "https://a.b/c.png"})));
        assert!(!is_external_icon(&json!({"type": "builtin", "name": "star"})));
        assert!(!is_external_icon(&json!("star")));
        assert!(!is_external_icon(&json!("data:image/png;base64,AAAA")));
    }

    #[test]
    fn test_capacity_limits() {
        let big = Payload::Source(SourcePayload {
            code: "#".repeat(2048),
            ..Default::default()
        });
        let err = sanitize(big, true, &limits()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Capacity);

        let many = Payload::parse(
            TaskType::FromSource,
            json!({"code": "text(\"a\", [0, 0])\ntext(\"b\", [0, 0])\ntext(\"c\", [0, 0])\ntext(\"d\", [0, 0])"}),
        )
        .unwrap();
        let err = sanitize(many, false, &limits()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Capacity);
    }

    #[test]
    fn test_embedded_audio_measured_decoded() {
        assert_eq!(embedded_audio_bytes("data:audio/mp3;base64,AAAA").unwrap(), Some(3));
        assert_eq!(embedded_audio_bytes("/audio/x.mp3").unwrap(), None);
        assert!(embedded_audio_bytes("data:audio/mp3;base64,***").is_err());

        let payload = Payload::parse(
            TaskType::FromSource,
            json!({"code": "music(\"data:audio/mp3;base64,AAAAAAAA\")"}),
        )
        .unwrap();
        let err = sanitize(payload, false, &limits()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Capacity);
    }
}
