use std::fmt;

/// Build a `DexError` of the given kind, optionally formatting the message.
#[macro_export]
macro_rules! err {
    ($kind:ident, $msg:literal) => {
        $crate::dex::error::DexError::new($crate::dex::error::DexErrorKind::$kind, $msg)
    };
    ($kind:ident, $fmtstr:literal, $($args:tt)*) => {
        $crate::dex::error::DexError::new($crate::dex::error::DexErrorKind::$kind, &format!($fmtstr, $($args)*))
    };
}

/// Return early with a `DexError` of the given kind.
#[macro_export]
macro_rules! fail {
    ($kind:ident, $msg:literal) => {
        return Err($crate::err!($kind, $msg))
    };
    ($kind:ident, $fmtstr:literal, $($args:tt)*) => {
        return Err($crate::err!($kind, $fmtstr, $($args)*))
    };
}

/// The class of structural problem found in a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DexErrorKind
{
    BadMagic,
    BadVersion,
    BadSize,
    BadOffset,
    BadIndex,
    BadUtf8,
    TruncatedLeb128,
    BadDebugInfo,
    BadChecksum,
    BadSignature,
    BadMapList,
    BadCodeItem,
    BadArchive,
}

impl DexErrorKind
{
    pub fn as_str(&self) -> &'static str
    {
        match self {
            DexErrorKind::BadMagic => "bad magic",
            DexErrorKind::BadVersion => "bad version",
            DexErrorKind::BadSize => "bad size",
            DexErrorKind::BadOffset => "bad offset",
            DexErrorKind::BadIndex => "bad index",
            DexErrorKind::BadUtf8 => "bad modified utf-8",
            DexErrorKind::TruncatedLeb128 => "truncated leb128",
            DexErrorKind::BadDebugInfo => "bad debug info",
            DexErrorKind::BadChecksum => "bad checksum",
            DexErrorKind::BadSignature => "bad signature",
            DexErrorKind::BadMapList => "bad map list",
            DexErrorKind::BadCodeItem => "bad code item",
            DexErrorKind::BadArchive => "bad archive",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DexError
{
    kind: DexErrorKind,
    msg: String,
    contexts: Vec<String>,
}

impl DexError
{
    pub(crate) fn new(kind: DexErrorKind, msg: &str) -> Self
    {
        DexError {
            kind,
            msg: msg.to_string(),
            contexts: Vec::new(),
        }
    }

    pub(crate) fn with_context(base: DexError, context: String) -> Self
    {
        let mut contexts = base.contexts;
        contexts.push(context);
        DexError { kind: base.kind, msg: base.msg, contexts }
    }

    pub fn kind(&self) -> DexErrorKind
    {
        self.kind
    }

    pub fn message(&self) -> &str
    {
        &self.msg
    }
}

/// Attach a context string to the error side of a `Result`.
pub(crate) trait ResultExt<T>
{
    fn context<F: FnOnce() -> String>(self, f: F) -> Result<T, DexError>;
}

impl<T> ResultExt<T> for Result<T, DexError>
{
    fn context<F: FnOnce() -> String>(self, f: F) -> Result<T, DexError>
    {
        self.map_err(|e| DexError::with_context(e, f()))
    }
}

impl fmt::Display for DexError
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}: {}", self.kind.as_str(), self.msg)?;
        let mut connector = " for ";
        for context in &self.contexts
        {
            write!(f, "{}{}", connector, context)?;
            connector = " of ";
        }
        Ok(())
    }
}

impl std::error::Error for DexError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_chains_contexts()
    {
        let e = err!(BadIndex, "type index {} out of range", 7);
        let e = DexError::with_context(e, "field_id #3".to_string());
        let e = DexError::with_context(e, "class_def #0".to_string());
        assert_eq!(e.kind(), DexErrorKind::BadIndex);
        assert_eq!(e.to_string(), "bad index: type index 7 out of range for field_id #3 of class_def #0");
    }

    #[test]
    fn context_ext_keeps_kind()
    {
        let r: Result<(), DexError> = Err(err!(BadOffset, "past end"));
        let e = r.context(|| "string_ids".to_string()).unwrap_err();
        assert_eq!(e.kind(), DexErrorKind::BadOffset);
        assert!(e.to_string().ends_with("for string_ids"));
    }
}
