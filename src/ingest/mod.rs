pub mod ocr;
pub mod spreadsheet;

/// Upload categories accepted by the chat input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Image,
    Spreadsheet,
}

pub fn classify_upload(file_name: &str, content_type: Option<&str>) -> Option<UploadKind> {
    let content_type = content_type.unwrap_or("");
    if content_type.starts_with("image/") {
        return Some(UploadKind::Image);
    }
    if
        matches!(
            content_type,
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" |
                "application/vnd.ms-excel" |
                "text/csv"
        ) ||
        spreadsheet::is_spreadsheet(file_name)
    {
        return Some(UploadKind::Spreadsheet);
    }
    let lower = file_name.to_lowercase();
    if [".png", ".jpg", ".jpeg", ".gif", ".bmp", ".webp"].iter().any(|ext| lower.ends_with(ext)) {
        return Some(UploadKind::Image);
    }
    None
}
