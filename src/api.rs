//! JSON shapes for the embedding application.
//!
//! Everything the proxy hands outward is a `serde_json::Value` map so a
//! frontend can consume it without knowing the crate's types.

use std::collections::HashMap;
use std::time::SystemTime;

use serde_json::{json, Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::session::{
    MessageDirection, MessageKind, RequestDiff, RequestRecord, ResponseRecord, Session,
    SessionKind, WebSocketMessage, WebSocketRecord,
};

const PREVIEW_LIMIT: usize = 100;

fn kind_label(kind: SessionKind) -> &'static str {
    match kind {
        SessionKind::Http => "HTTPSession",
        SessionKind::WebSocket => "WebSocketSession",
    }
}

fn message_kind_label(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Text => "text",
        MessageKind::Binary => "binary",
        MessageKind::Close => "close",
        MessageKind::Ping => "ping",
        MessageKind::Pong => "pong",
        MessageKind::Continuation => "continuation",
    }
}

fn timestamp(time: SystemTime) -> Value {
    OffsetDateTime::from(time)
        .format(&Rfc3339)
        .map(Value::String)
        .unwrap_or(Value::Null)
}

fn cookies_json(cookies: &HashMap<String, String>) -> Value {
    let map: Map<String, Value> = cookies
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    Value::Object(map)
}

fn preview(text: &str) -> String {
    if text.len() > PREVIEW_LIMIT {
        let mut end = PREVIEW_LIMIT;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    } else {
        text.to_owned()
    }
}

fn status_of(session: &Session) -> u16 {
    session.response.as_ref().map(|r| r.status_code).unwrap_or(0)
}

/// The list entry for `list_sessions`.
pub(crate) fn session_summary(session: &Session) -> Value {
    let mut summary = json!({
        "id": session.id,
        "method": session.request.method,
        "url": session.request.url,
        "timestamp": timestamp(session.timestamp),
        "duration": session.duration.as_millis() as u64,
        "type": kind_label(session.kind),
        "status": status_of(session),
    });

    if session.kind == SessionKind::WebSocket {
        summary["webSocketData"] = session
            .websocket
            .as_ref()
            .map(websocket_summary)
            .unwrap_or_else(|| json!({ "state": "unknown", "messageStats": stats_json(&Default::default()) }));
    }

    if let Some(error) = &session.error {
        summary["error"] = Value::String(error.clone());
    }

    summary
}

fn websocket_summary(ws: &WebSocketRecord) -> Value {
    json!({
        "state": ws.state.label(),
        "messageStats": stats_json(&ws.stats),
        "connectedAt": timestamp(ws.connected_at),
        "disconnectedAt": ws.disconnected_at.map(timestamp).unwrap_or(Value::Null),
        "connectionDuration": ws.connection_duration.as_millis() as u64,
        "subprotocol": ws.subprotocol,
        "extensions": ws.extensions,
        "closeCode": ws.close_code,
        "closeReason": ws.close_reason,
    })
}

fn stats_json(stats: &crate::session::MessageStats) -> Value {
    json!({
        "totalMessages": stats.total_messages,
        "inboundMessages": stats.inbound_messages,
        "outboundMessages": stats.outbound_messages,
        "textMessages": stats.text_messages,
        "binaryMessages": stats.binary_messages,
        "inboundBytes": stats.inbound_bytes,
        "outboundBytes": stats.outbound_bytes,
        "totalBytes": stats.total_bytes,
        "controlFrames": stats.control_frames,
    })
}

/// The full record for `session_detail`.
pub(crate) fn session_detail(session: &Session) -> Value {
    let mut detail = json!({
        "id": session.id,
        "method": session.request.method,
        "url": session.request.url,
        "timestamp": timestamp(session.timestamp),
        "duration": session.duration.as_millis() as u64,
        "protocol": session.protocol,
        "type": kind_label(session.kind),
        "requestHeaders": serde_json::to_value(&session.request.headers).unwrap_or(Value::Null),
        "requestCookies": cookies_json(&session.request.cookies),
        "requestBody": session.request.body_text(),
        "tlsProfile": session
            .tls
            .as_ref()
            .map(|p| p.to_json())
            .unwrap_or_else(|| json!({})),
        "status": status_of(session),
    });

    match &session.response {
        Some(response) => {
            detail["responseHeaders"] =
                serde_json::to_value(&response.headers).unwrap_or(Value::Null);
            detail["responseCookies"] = cookies_json(&response.cookies);
            detail["responseBody"] = Value::String(response.body.clone());
        }
        None => {
            detail["responseHeaders"] = json!({});
            detail["responseCookies"] = json!({});
            detail["responseBody"] = Value::String(String::new());
        }
    }

    if session.kind == SessionKind::WebSocket {
        detail["webSocketData"] = session
            .websocket
            .as_ref()
            .map(|ws| websocket_detail(session, ws))
            .unwrap_or_else(|| {
                json!({
                    "state": "unknown",
                    "messageStats": stats_json(&Default::default()),
                    "messages": { "messages": [] },
                })
            });
    }

    if let Some(error) = &session.error {
        detail["error"] = Value::String(error.clone());
    }

    detail
}

fn websocket_detail(session: &Session, ws: &WebSocketRecord) -> Value {
    let mut data = websocket_summary(ws);

    data["upgradeRequest"] = ws
        .upgrade_request
        .as_ref()
        .map(request_json)
        .unwrap_or_else(|| request_json(&session.request));
    data["upgradeResponse"] = match (&ws.upgrade_response, &session.response) {
        (Some(response), _) => response_json(response),
        (None, Some(response)) => response_json(response),
        (None, None) => json!({
            "statusCode": 0,
            "status": "No Response",
            "headers": {},
            "cookies": {},
            "body": "",
            "contentType": "",
        }),
    };
    data["messages"] = json!({
        "messages": ws.messages.iter().map(message_json).collect::<Vec<_>>(),
    });

    data
}

fn request_json(request: &RequestRecord) -> Value {
    json!({
        "method": request.method,
        "url": request.url,
        "headers": serde_json::to_value(&request.headers).unwrap_or(Value::Null),
        "cookies": cookies_json(&request.cookies),
        "body": request.body_text(),
        "contentType": request.content_type,
    })
}

fn response_json(response: &ResponseRecord) -> Value {
    json!({
        "statusCode": response.status_code,
        "status": response.status_text,
        "headers": serde_json::to_value(&response.headers).unwrap_or(Value::Null),
        "cookies": cookies_json(&response.cookies),
        "body": response.body,
        "contentType": response.content_type,
    })
}

fn message_json(message: &WebSocketMessage) -> Value {
    json!({
        "id": message.id,
        "timestamp": timestamp(message.timestamp),
        "direction": match message.direction {
            MessageDirection::Inbound => "inbound",
            MessageDirection::Outbound => "outbound",
        },
        "type": message_kind_label(message.kind),
        "opcode": message.opcode,
        "payload": String::from_utf8_lossy(&message.payload),
        "payloadText": message.payload_text.clone().unwrap_or_default(),
        "isMasked": message.is_masked,
        "isFragment": message.is_fragment,
        "size": message.size,
    })
}

/// The compact entry returned for search hits: bodies are previewed, headers
/// rendered as text.
pub(crate) fn search_entry(session: &Session) -> Value {
    json!({
        "id": session.id,
        "method": session.request.method,
        "url": session.request.url,
        "status": status_of(session),
        "timestamp": timestamp(session.timestamp),
        "duration": session.duration.as_millis() as u64,
        "requestHeaders": session.request.headers.to_string(),
        "requestCookies": cookies_json(&session.request.cookies),
        "requestBody": preview(&session.request.body_text()),
        "responseHeaders": session
            .response
            .as_ref()
            .map(|r| r.headers.to_string())
            .unwrap_or_default(),
        "responseCookies": session
            .response
            .as_ref()
            .map(|r| cookies_json(&r.cookies))
            .unwrap_or_else(|| json!({})),
        "responseBody": session
            .response
            .as_ref()
            .map(|r| preview(&r.body))
            .unwrap_or_default(),
    })
}

/// The comparison document for `compare`.
pub(crate) fn compare_sessions(first: &Session, second: &Session) -> Value {
    let diff = first.request_diff(second);

    let mut result = json!({
        "session1": search_entry(first),
        "session2": search_entry(second),
    });

    if diff.has_diffs {
        result["differences"] = diff_json(&diff);
    } else {
        result["differences"] = Value::String("No differences found".to_owned());
    }

    result
}

fn diff_json(diff: &RequestDiff) -> Value {
    let mut map = Map::new();

    for (name, field) in [
        ("url", &diff.url),
        ("method", &diff.method),
        ("body", &diff.body),
        ("contentType", &diff.content_type),
    ] {
        if field.changed {
            map.insert(
                name.to_owned(),
                json!({ "original": field.original, "other": field.other }),
            );
        }
    }

    for (name, entries) in [("headers", &diff.headers), ("cookies", &diff.cookies)] {
        if entries.changed {
            let modified: Map<String, Value> = entries
                .modified
                .iter()
                .map(|(key, field)| {
                    (
                        key.clone(),
                        json!({ "original": field.original, "other": field.other }),
                    )
                })
                .collect();
            map.insert(
                name.to_owned(),
                json!({
                    "changed": true,
                    "modified": modified,
                    "added": entries.added,
                    "removed": entries.removed,
                }),
            );
        }
    }

    Value::Object(map)
}
