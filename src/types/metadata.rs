//! Track metadata passed from the player to remote speakers

/// Track metadata snapshot.
///
/// Artwork dimensions are not stored; [`OutputMetadata::artwork_dims`]
/// derives them on demand from the image header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputMetadata {
    /// Track length in milliseconds
    pub length_ms: u32,
    /// Track title
    pub title: String,
    /// Album name
    pub album: String,
    /// Artist name
    pub artist: String,
    /// Raw artwork bytes (may be empty)
    pub artwork_data: Vec<u8>,
    /// Artwork MIME type (`image/jpeg`, `image/png`, `image/gif`,
    /// or `image/none` to clear)
    pub artwork_type: String,
    /// Playlist position: (index, total)
    pub playlist_pos: (u16, u16),
}

impl OutputMetadata {
    /// True when there is nothing to report to a speaker.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.length_ms == 0 && self.title.is_empty()
    }

    /// Artwork (width, height) parsed from the image header, or (-1, -1)
    /// when the dimensions cannot be determined.
    #[must_use]
    pub fn artwork_dims(&self) -> (i32, i32) {
        match self.artwork_type.as_str() {
            "image/none" => (0, 0),
            "image/jpeg" => jpeg_dims(&self.artwork_data),
            "image/png" => png_dims(&self.artwork_data),
            "image/gif" => gif_dims(&self.artwork_data),
            _ => (-1, -1),
        }
    }
}

/// Scan JPEG markers for a SOFn segment and read the frame dimensions.
fn jpeg_dims(jpg: &[u8]) -> (i32, i32) {
    let n = jpg.len();
    if n < 4 || jpg[0] != 0xFF || jpg[1] != 0xD8 {
        return (-1, -1);
    }

    let mut i = 2;
    loop {
        // scan to the next marker prefix, then past fill bytes
        while i < n && jpg[i] != 0xFF {
            i += 1;
        }
        while i < n && jpg[i] == 0xFF {
            i += 1;
        }
        if i + 2 > n {
            return (-1, -1);
        }

        let marker = jpg[i - 1];
        let len = u16::from_be_bytes([jpg[i], jpg[i + 1]]) as usize;
        match marker {
            // SOF0..SOF15 except DHT (0xC4), JPG (0xC8) and DAC (0xCC)
            0xC0 | 0xC1 | 0xC2 | 0xC3 | 0xC5 | 0xC6 | 0xC7 | 0xC9 | 0xCA | 0xCB | 0xCD | 0xCE
            | 0xCF => {
                if len > 7 && i + 7 <= n {
                    let height = i32::from(u16::from_be_bytes([jpg[i + 3], jpg[i + 4]]));
                    let width = i32::from(u16::from_be_bytes([jpg[i + 5], jpg[i + 6]]));
                    return (width, height);
                }
                return (-1, -1);
            }
            _ => {
                if len == 0 {
                    return (-1, -1);
                }
                i += len;
            }
        }
    }
}

/// Read dimensions from the PNG IHDR chunk, which is always first.
fn png_dims(png: &[u8]) -> (i32, i32) {
    if png.len() <= 32 {
        return (-1, -1);
    }
    let width = u32::from_be_bytes([png[16], png[17], png[18], png[19]]);
    let height = u32::from_be_bytes([png[20], png[21], png[22], png[23]]);
    (clamp_dim(width), clamp_dim(height))
}

/// Read dimensions from the GIF logical screen descriptor.
fn gif_dims(gif: &[u8]) -> (i32, i32) {
    if gif.len() <= 10 || (&gif[0..6] != b"GIF87a" && &gif[0..6] != b"GIF89a") {
        return (-1, -1);
    }
    let width = i32::from(u16::from_le_bytes([gif[6], gif[7]]));
    let height = i32::from(u16::from_le_bytes([gif[8], gif[9]]));
    (width, height)
}

fn clamp_dim(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_with_artwork(mime: &str, data: Vec<u8>) -> OutputMetadata {
        OutputMetadata {
            artwork_type: mime.into(),
            artwork_data: data,
            ..OutputMetadata::default()
        }
    }

    #[test]
    fn none_artwork_is_zero_by_zero() {
        let meta = meta_with_artwork("image/none", Vec::new());
        assert_eq!(meta.artwork_dims(), (0, 0));
    }

    #[test]
    fn png_header_dims() {
        let mut png = Vec::new();
        png.extend_from_slice(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);
        png.extend_from_slice(&13u32.to_be_bytes());
        png.extend_from_slice(b"IHDR");
        png.extend_from_slice(&640u32.to_be_bytes());
        png.extend_from_slice(&480u32.to_be_bytes());
        png.extend_from_slice(&[8, 6, 0, 0, 0]);
        png.extend_from_slice(&[0; 8]);

        let meta = meta_with_artwork("image/png", png);
        assert_eq!(meta.artwork_dims(), (640, 480));
    }

    #[test]
    fn gif_header_dims() {
        let mut gif = b"GIF89a".to_vec();
        gif.extend_from_slice(&300u16.to_le_bytes());
        gif.extend_from_slice(&200u16.to_le_bytes());
        gif.extend_from_slice(&[0; 8]);

        let meta = meta_with_artwork("image/gif", gif);
        assert_eq!(meta.artwork_dims(), (300, 200));
    }

    #[test]
    fn jpeg_sof0_dims() {
        // SOI, APP0 (empty-ish), SOF0 with 1000x800 frame
        let mut jpg = vec![0xFF, 0xD8];
        jpg.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x04, 0x00, 0x00]);
        jpg.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08]);
        jpg.extend_from_slice(&800u16.to_be_bytes()); // height
        jpg.extend_from_slice(&1000u16.to_be_bytes()); // width
        jpg.extend_from_slice(&[0x03, 0, 0, 0, 0, 0, 0, 0, 0, 0]);

        let meta = meta_with_artwork("image/jpeg", jpg);
        assert_eq!(meta.artwork_dims(), (1000, 800));
    }

    #[test]
    fn truncated_images_yield_unknown() {
        assert_eq!(
            meta_with_artwork("image/jpeg", vec![0xFF]).artwork_dims(),
            (-1, -1)
        );
        assert_eq!(
            meta_with_artwork("image/png", vec![0; 16]).artwork_dims(),
            (-1, -1)
        );
        assert_eq!(
            meta_with_artwork("image/gif", b"GIF".to_vec()).artwork_dims(),
            (-1, -1)
        );
    }

    #[test]
    fn emptiness() {
        assert!(OutputMetadata::default().is_empty());
        let meta = OutputMetadata {
            title: "Song".into(),
            ..OutputMetadata::default()
        };
        assert!(!meta.is_empty());
    }
}
