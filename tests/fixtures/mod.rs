//! Canned backend payloads for the fake API server
#![allow(dead_code)]

use serde_json::{json, Value};

/// 1x1 PNG, enough for MIME sniffing.
pub const TINY_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F, 0x15, 0xC4,
    0x89, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78, 0xDA, 0x63, 0xFC, 0xCF, 0xC0, 0x50,
    0x0F, 0x00, 0x04, 0x85, 0x01, 0x80, 0x84, 0xA9, 0x8C, 0x21, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45,
    0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

/// The "Pink Tee" analysis used across the workflow tests.
pub fn pink_tee_result() -> Value {
    json!({
        "annotated_image_base64": "iVBORw0KGgo=",
        "components": [{
            "name": "Top",
            "dominant_color": "#112233",
            "clothing_items": [{
                "title": "Pink Tee",
                "thumbnail": "https://img.example/pink-tee.jpg",
                "price": "$20",
                "link": "https://shop.example/pink-tee"
            }]
        }]
    })
}

pub fn pending(job_id: &str) -> Value {
    snapshot(job_id, "pending", None, None)
}

pub fn processing(job_id: &str) -> Value {
    snapshot(job_id, "processing", None, None)
}

pub fn completed(job_id: &str) -> Value {
    snapshot(job_id, "completed", Some(pink_tee_result()), None)
}

pub fn failed(job_id: &str, error: Option<&str>) -> Value {
    snapshot(job_id, "failed", None, error)
}

fn snapshot(job_id: &str, status: &str, result: Option<Value>, error: Option<&str>) -> Value {
    json!({
        "_id": "665f1c2e9b1e8a0012345678",
        "job_id": job_id,
        "user_id": "ana@example.com",
        "status": status,
        "result": result,
        "error": error,
        "filename": "outfit.png",
        "created_at": "2024-05-01T10:00:00.123456",
        "updated_at": "2024-05-01T10:00:02.654321"
    })
}

/// Body returned with a 403 once a free account has used its weekly uploads.
pub fn weekly_limit_detail() -> Value {
    json!({
        "detail": {
            "message": "Weekly upload limit reached. Upgrade to premium for unlimited uploads.",
            "uploads_used": 3,
            "uploads_limit": 3
        }
    })
}

pub fn free_tier_limit(used: u32) -> Value {
    json!({
        "can_upload": used < 3,
        "reason": if used < 3 { "Within weekly limit" } else { "Weekly upload limit reached" },
        "uploads_used": used,
        "uploads_limit": 3
    })
}
