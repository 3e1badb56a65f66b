/// What the validation gate needs to know about a received part, whichever
/// strategy received it.
pub trait FormPart {
    fn field_name(&self) -> &str;

    /// Empty when the field was submitted without a file attached.
    fn file_name(&self) -> &str;

    fn is_file(&self) -> bool {
        !self.file_name().is_empty()
    }
}
