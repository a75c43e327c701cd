use crate::error::{Error, Result};
use crate::storage::paths::image_ancestry_path;
use crate::storage::Storage;

/// Ancestry of `image_id`, the image itself first and the root last.
pub fn read(store: &dyn Storage, image_id: &str) -> Result<Vec<String>> {
    let data = store.get_content(&image_ancestry_path(image_id))?;
    serde_json::from_slice(&data)
        .map_err(|e| Error::InvalidRequest(format!("corrupt ancestry for {}: {}", image_id, e)))
}

/// Writes the ancestry of `image_id`: `[image_id]` without a parent, else
/// `image_id` prepended to the parent's. The parent's ancestry has to exist,
/// `Error::NotFound` otherwise.
pub fn build(store: &dyn Storage, image_id: &str, parent_id: Option<&str>) -> Result<Vec<String>> {
    let ancestry = match parent_id {
        None => vec![image_id.to_string()],
        Some(parent_id) => {
            let mut ancestry = read(store, parent_id)?;
            ancestry.insert(0, image_id.to_string());
            ancestry
        }
    };
    let data = serde_json::to_vec(&ancestry)
        .map_err(|e| Error::InvalidRequest(format!("ancestry for {}: {}", image_id, e)))?;
    store.put_content(&image_ancestry_path(image_id), &data)?;
    Ok(ancestry)
}
