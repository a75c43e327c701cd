// Logical keys for image objects, and the mapping of a logical key onto a
// backend root. Every backend stores the same flat, slash-delimited layout.

const IMAGES: &str = "images";

/// Sentinel that marks an upload as in progress.
pub const MARK: &str = "_inprogress";

pub fn image_layer_path(image_id: &str) -> String {
    image_object(image_id, "layer")
}

pub fn image_json_path(image_id: &str) -> String {
    image_object(image_id, "json")
}

pub fn image_checksum_path(image_id: &str) -> String {
    image_object(image_id, "checksum")
}

pub fn image_mark_path(image_id: &str) -> String {
    image_object(image_id, MARK)
}

pub fn image_ancestry_path(image_id: &str) -> String {
    image_object(image_id, "ancestry")
}

pub fn image_files_path(image_id: &str) -> String {
    image_object(image_id, "files")
}

fn image_object(image_id: &str, role: &str) -> String {
    format!("{}/{}/{}", IMAGES, image_id, role)
}

/// Last path segment of a key, i.e. the object role for image keys.
pub fn role(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Roots `key` under `root`.
///
/// An empty key is the root itself. Otherwise root and key are joined with
/// exactly one separator and a single leading separator is stripped, since
/// object stores reject keys starting with `/`. A key whose first segment
/// already is `root` is left as it is, without joining, which keeps
/// normalization idempotent. With root `images`, `images/a/json` therefore
/// stays `images/a/json`.
pub fn normalize(root: &str, key: &str) -> String {
    if key.is_empty() {
        return root.to_string();
    }
    let key = key.strip_prefix('/').unwrap_or(key);
    let trimmed_root = root.trim_matches('/');
    let joined = if trimmed_root.is_empty() || is_rooted(trimmed_root, key) {
        key.to_string()
    } else {
        format!("{}/{}", root.trim_end_matches('/'), key)
    };
    match joined.strip_prefix('/') {
        Some(stripped) => stripped.to_string(),
        None => joined,
    }
}

fn is_rooted(trimmed_root: &str, key: &str) -> bool {
    key == trimmed_root
        || key
            .strip_prefix(trimmed_root)
            .map_or(false, |rest| rest.starts_with('/'))
}
