//! Vendors and model versions disagree on where the result URL lives. Each
//! extractor knows one shape; they are tried in table order and the first hit wins.

use serde_json::Value;

use crate::assets::AssetRef;

pub type Extractor = fn(&Value) -> Option<String>;

pub const RESULT_EXTRACTORS: &[(&str, Extractor)] = &[
    ("model_mesh.url", model_mesh_url),
    ("model_urls.glb", model_urls_glb),
    ("image.url", image_url),
    ("data", data_wrapper),
    ("images[0].url", first_image_url),
    ("output", output_url),
];

/// Shapes that may appear inside a `data` wrapper.
const DIRECT_EXTRACTORS: &[Extractor] = &[model_mesh_url, model_urls_glb, image_url];

/// Returns the matching shape name and the normalized asset.
pub fn extract_result(payload: &Value) -> Option<(&'static str, AssetRef)> {
    RESULT_EXTRACTORS.iter().find_map(|(shape, extractor)| {
        extractor(payload).map(|url| (*shape, result_asset(url)))
    })
}

/// Vendor results are never local paths: anything that is not inline is a remote reference.
fn result_asset(url: String) -> AssetRef {
    if url.starts_with("data:") {
        AssetRef::Inline(url)
    } else {
        AssetRef::Remote(url)
    }
}

fn model_mesh_url(payload: &Value) -> Option<String> {
    payload.get("model_mesh").and_then(url_field)
}

fn model_urls_glb(payload: &Value) -> Option<String> {
    payload
        .get("model_urls")
        .and_then(|urls| urls.get("glb"))
        .and_then(url_field)
}

fn image_url(payload: &Value) -> Option<String> {
    payload.get("image").and_then(url_field)
}

fn data_wrapper(payload: &Value) -> Option<String> {
    let data = payload.get("data")?;
    DIRECT_EXTRACTORS
        .iter()
        .find_map(|extractor| extractor(data))
}

fn first_image_url(payload: &Value) -> Option<String> {
    payload
        .get("images")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(url_field)
}

fn output_url(payload: &Value) -> Option<String> {
    match payload.get("output")? {
        Value::Array(rows) => rows.iter().find_map(url_field),
        other => url_field(other),
    }
}

/// Accepts either a bare string or an object carrying `url`.
fn url_field(value: &Value) -> Option<String> {
    let raw = match value {
        Value::String(url) => url.as_str(),
        Value::Object(obj) => obj.get("url").and_then(Value::as_str)?,
        _ => return None,
    };
    Some(raw.trim())
        .filter(|url| !url.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn url_of(payload: Value) -> Option<String> {
        extract_result(&payload).and_then(|(_, asset)| asset.as_url().map(str::to_string))
    }

    #[test]
    fn each_known_shape_is_recognized() {
        assert_eq!(
            url_of(json!({"model_mesh": {"url": "https://a"}})),
            Some("https://a".to_string())
        );
        assert_eq!(
            url_of(json!({"data": {"model_urls": {"glb": {"url": "https://b"}}}})),
            Some("https://b".to_string())
        );
        assert_eq!(
            url_of(json!({"images": [{"url": "https://c"}, {"url": "https://d"}]})),
            Some("https://c".to_string())
        );
        assert_eq!(
            url_of(json!({"image": {"url": "https://depth", "width": 512}})),
            Some("https://depth".to_string())
        );
        assert_eq!(
            url_of(json!({"output": ["https://replicate/out.png"]})),
            Some("https://replicate/out.png".to_string())
        );
    }

    #[test]
    fn bare_identifiers_are_kept_as_remote_references() {
        assert_eq!(url_of(json!({"model_mesh": {"url": "a"}})), Some("a".to_string()));
        assert_eq!(
            url_of(json!({"data": {"model_urls": {"glb": {"url": "b"}}}})),
            Some("b".to_string())
        );
        assert_eq!(url_of(json!({"images": [{"url": "c"}]})), Some("c".to_string()));
        assert_eq!(
            extract_result(&json!({"model_mesh": {"url": " meshes/house.glb "}}))
                .map(|(_, asset)| asset),
            Some(AssetRef::Remote("meshes/house.glb".to_string()))
        );
    }

    #[test]
    fn declared_priority_decides_when_shapes_overlap() {
        let all = json!({
            "images": [{"url": "https://c"}],
            "data": {"model_urls": {"glb": {"url": "https://b"}}},
            "model_mesh": {"url": "https://a"}
        });
        assert_eq!(
            extract_result(&all).map(|(shape, _)| shape),
            Some("model_mesh.url")
        );
        assert_eq!(url_of(all), Some("https://a".to_string()));

        let nested_and_array = json!({
            "images": [{"url": "https://c"}],
            "data": {"model_urls": {"glb": {"url": "https://b"}}}
        });
        assert_eq!(url_of(nested_and_array), Some("https://b".to_string()));
    }

    #[test]
    fn unusable_values_fall_through_to_later_shapes() {
        let payload = json!({
            "model_mesh": {"url": "  "},
            "image": {"url": 42},
            "images": [{"url": "https://c"}]
        });
        assert_eq!(url_of(payload), Some("https://c".to_string()));
    }

    #[test]
    fn inline_results_normalize_to_inline_assets() {
        let payload = json!({"images": [{"url": "data:image/png;base64,AAAA"}]});
        assert_eq!(
            extract_result(&payload).map(|(_, asset)| asset),
            Some(AssetRef::Inline("data:image/png;base64,AAAA".to_string()))
        );
    }

    #[test]
    fn missing_fields_yield_none() {
        assert!(extract_result(&json!({"request_id": "abc"})).is_none());
        assert!(extract_result(&json!({"images": []})).is_none());
        assert!(extract_result(&json!([1, 2, 3])).is_none());
    }
}
