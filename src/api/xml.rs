//! XML error envelope

/// Escape special XML characters in a string
pub fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Body sent with every 401 and 403.
pub fn access_denied(bucket: &str, request_id: &str, host_id: &str) -> String {
    format!(
        "<Error><Code>AccessDenied</Code><BucketName>{}</BucketName><RequestId>{}</RequestId><HostId>{}</HostId></Error>",
        escape_xml(bucket),
        escape_xml(request_id),
        escape_xml(host_id)
    )
}
