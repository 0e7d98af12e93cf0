/// Per-request metadata inserted by [`crate::security::request_id`].
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub request_id: String,
}
