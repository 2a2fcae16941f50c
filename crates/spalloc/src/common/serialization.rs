use bincode::Options;

#[inline]
pub(crate) fn bincode_config() -> impl Options {
    bincode::DefaultOptions::new().allow_trailing_bytes()
}
