use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::error;
use std::fs;

/// One uploaded file as seen by the extractor: where the transport layer
/// stored it, plus what the client said it was.
#[derive(Clone, Debug)]
pub struct UploadedFile {
    pub original_name: String,
    pub mimetype: String,
    pub path: String,
}

pub fn is_image(mimetype: &str) -> bool {
    mimetype.starts_with("image/")
}

/// Convert a non-image upload into descriptive text for the model.
/// Never fails: unsupported types and read errors degrade to a labelled
/// placeholder so one bad file cannot abort the whole exchange.
pub fn extract_text(file: &UploadedFile) -> String {
    let mimetype = file.mimetype.as_str();

    if mimetype.starts_with("text/")
        || mimetype == "application/json"
        || mimetype == "application/xml"
        || mimetype == "application/javascript"
    {
        match fs::read_to_string(&file.path) {
            Ok(content) => {
                return format!("[Content from Text File: {}]\n{}", file.original_name, content);
            }
            Err(e) => {
                error!("Error extracting text from {}: {}", file.original_name, e);
                return format!("[Error extracting content from {}]", file.original_name);
            }
        }
    }

    format!(
        "[File attached: {} ({}) - Content extraction not supported for this type]",
        file.original_name, mimetype
    )
}

/// Read an image upload and encode it for the provider's `images` field.
/// Read failures surface as `None`; the caller drops the image and keeps
/// the exchange alive.
pub fn read_image_base64(file: &UploadedFile) -> Option<String> {
    match fs::read(&file.path) {
        Ok(bytes) => Some(BASE64.encode(bytes)),
        Err(e) => {
            error!("Error reading image {}: {}", file.original_name, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_upload(name: &str, mimetype: &str, bytes: &[u8]) -> (tempfile::TempDir, UploadedFile) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(bytes).unwrap();
        let upload = UploadedFile {
            original_name: name.to_string(),
            mimetype: mimetype.to_string(),
            path: path.to_string_lossy().into_owned(),
        };
        (dir, upload)
    }

    #[test]
    fn text_file_contents_are_labelled() {
        let (_dir, file) = temp_upload("notes.txt", "text/plain", b"hello world");
        let text = extract_text(&file);
        assert!(text.contains("[Content from Text File: notes.txt]"));
        assert!(text.contains("hello world"));
    }

    #[test]
    fn unsupported_type_degrades_to_placeholder() {
        let (_dir, file) = temp_upload("tune.mp3", "audio/mpeg", b"\x00\x01");
        let text = extract_text(&file);
        assert!(text.contains("Content extraction not supported"));
        assert!(text.contains("tune.mp3"));
    }

    #[test]
    fn missing_file_degrades_to_error_placeholder() {
        let file = UploadedFile {
            original_name: "gone.txt".to_string(),
            mimetype: "text/plain".to_string(),
            path: "/nonexistent/gone.txt".to_string(),
        };
        assert_eq!(extract_text(&file), "[Error extracting content from gone.txt]");
    }

    #[test]
    fn image_encodes_to_base64() {
        let (_dir, file) = temp_upload("pix.png", "image/png", &[0x89, 0x50, 0x4e, 0x47]);
        assert!(is_image(&file.mimetype));
        let b64 = read_image_base64(&file).unwrap();
        assert_eq!(BASE64.decode(b64).unwrap(), vec![0x89, 0x50, 0x4e, 0x47]);
    }
}
