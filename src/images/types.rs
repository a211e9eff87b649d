use serde::Deserialize;

/// One page of the remote gallery catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct GalleryPage {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub status: i32,
    #[serde(default)]
    pub data: Vec<GalleryEntry>,
}

/// A catalog entry: an album carrying an `images` list, or a bare item whose
/// `link` points at the media itself.
#[derive(Debug, Clone, Deserialize)]
pub struct GalleryEntry {
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub images: Option<Vec<GalleryImage>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GalleryImage {
    pub link: String,
    /// Size in bytes; zero when the catalog omits it.
    #[serde(default)]
    pub size: u64,
}
