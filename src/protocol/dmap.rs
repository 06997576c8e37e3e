//! DMAP tag encoding for track metadata
//!
//! DMAP is a TLV format: four-byte tag, four-byte big-endian length, value.
//! Speakers expect the track description wrapped in an `mlit` container.

use crate::types::OutputMetadata;
use bytes::{BufMut, BytesMut};

/// Append one tagged string value.
fn put_string(buf: &mut BytesMut, tag: &[u8; 4], value: &str) {
    buf.put_slice(tag);
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

/// Append one tagged u8 value.
fn put_u8(buf: &mut BytesMut, tag: &[u8; 4], value: u8) {
    buf.put_slice(tag);
    buf.put_u32(1);
    buf.put_u8(value);
}

/// Append one tagged u16 value.
fn put_u16(buf: &mut BytesMut, tag: &[u8; 4], value: u16) {
    buf.put_slice(tag);
    buf.put_u32(2);
    buf.put_u16(value);
}

/// Encode the `mlit` metadata listing a speaker displays for the current
/// track: item kind, name, album, artist, song-data-kind, and the playlist
/// position as track number/count.
#[must_use]
pub fn encode_track_listing(meta: &OutputMetadata) -> Vec<u8> {
    let mut item = BytesMut::with_capacity(128);

    // mikd 2 = music track
    put_u8(&mut item, b"mikd", 2);
    put_string(&mut item, b"minm", &meta.title);
    put_string(&mut item, b"asal", &meta.album);
    put_string(&mut item, b"asar", &meta.artist);
    // asdk 0 = timed file, 1 = stream (no known length)
    put_u8(&mut item, b"asdk", u8::from(meta.length_ms == 0));
    put_u16(&mut item, b"astn", meta.playlist_pos.0);
    put_u16(&mut item, b"astc", meta.playlist_pos.1);

    let mut listing = BytesMut::with_capacity(item.len() + 8);
    listing.put_slice(b"mlit");
    listing.put_u32(item.len() as u32);
    listing.put_slice(&item);
    listing.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find_tag<'a>(data: &'a [u8], tag: &[u8; 4]) -> Option<&'a [u8]> {
        let mut i = 0;
        while i + 8 <= data.len() {
            let len = u32::from_be_bytes([data[i + 4], data[i + 5], data[i + 6], data[i + 7]])
                as usize;
            if &data[i..i + 4] == tag {
                return Some(&data[i + 8..i + 8 + len]);
            }
            i += 8 + len;
        }
        None
    }

    fn sample_meta() -> OutputMetadata {
        OutputMetadata {
            length_ms: 215_000,
            title: "So What".into(),
            album: "Kind of Blue".into(),
            artist: "Miles Davis".into(),
            playlist_pos: (1, 9),
            ..OutputMetadata::default()
        }
    }

    #[test]
    fn listing_is_one_mlit_container() {
        let data = encode_track_listing(&sample_meta());
        assert_eq!(&data[0..4], b"mlit");
        let len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
        assert_eq!(len, data.len() - 8);
    }

    #[test]
    fn listing_fields() {
        let data = encode_track_listing(&sample_meta());
        let inner = &data[8..];

        assert_eq!(find_tag(inner, b"mikd"), Some(&[2u8][..]));
        assert_eq!(find_tag(inner, b"minm"), Some(&b"So What"[..]));
        assert_eq!(find_tag(inner, b"asal"), Some(&b"Kind of Blue"[..]));
        assert_eq!(find_tag(inner, b"asar"), Some(&b"Miles Davis"[..]));
        // known length means "timed file"
        assert_eq!(find_tag(inner, b"asdk"), Some(&[0u8][..]));
        assert_eq!(find_tag(inner, b"astn"), Some(&[0u8, 1][..]));
        assert_eq!(find_tag(inner, b"astc"), Some(&[0u8, 9][..]));
    }

    #[test]
    fn unknown_length_flips_data_kind() {
        let meta = OutputMetadata {
            length_ms: 0,
            title: "Radio".into(),
            ..OutputMetadata::default()
        };
        let data = encode_track_listing(&meta);
        assert_eq!(find_tag(&data[8..], b"asdk"), Some(&[1u8][..]));
    }
}
