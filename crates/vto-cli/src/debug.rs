use serde_json::{json, Value};

use crate::client::{SelectedImage, TryOnTransport, UploadClient};

/// Debug panel contents: launch parameters, where notifications would go,
/// current selections and the last notification sent. `None` unless the
/// client runs in debug mode.
pub fn debug_snapshot<T: TryOnTransport>(client: &UploadClient<T>) -> Option<Value> {
    let context = client.context();
    if !context.debug {
        return None;
    }
    let target = match context.resolve_target_origin(client.origin_policy()) {
        Ok(origin) => json!({ "targetOrigin": origin.as_str() }),
        Err(reason) => json!({ "withheld": reason }),
    };
    Some(json!({
        "context": {
            "embedded": context.embedded,
            "parentOrigin": context.parent_origin,
            "productId": context.product_id,
            "variantId": context.variant_id,
            "debug": context.debug,
        },
        "notificationTarget": target,
        "selections": {
            "userPhoto": client.user_photo().map(describe_selection),
            "clothingPhoto": client.clothing_photo().map(describe_selection),
        },
        "generated": client.generated().map(|image| json!({
            "mimeType": image.mime_type,
            "bytes": image.bytes.len(),
        })),
        "error": client.error(),
        "lastNotification": client.last_notification(),
    }))
}

pub fn render_debug_panel<T: TryOnTransport>(client: &UploadClient<T>) -> Option<String> {
    let snapshot = debug_snapshot(client)?;
    serde_json::to_string_pretty(&snapshot).ok()
}

fn describe_selection(selected: &SelectedImage) -> Value {
    json!({
        "fileName": selected.photo.file_name,
        "mimeType": selected.photo.effective_mime(),
        "bytes": selected.photo.bytes.len(),
    })
}
