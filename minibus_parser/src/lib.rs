/*!
 minibus_parser crate for parsing message bus type signatures.

 A type signature is a compact textual description of the shape of a
 marshaled value: single-character basic codes plus four container forms
 (arrays, structs, dictionary entries and variants).

 # Examples

 ```rust
 use minibus_parser::{Signature, SignatureIter};

 let sig: Signature = "ua(ssssssouso)".parse().unwrap();
 let types: Vec<&str> = SignatureIter::new(&sig)
     .collect::<Result<_, _>>()
     .unwrap();
 assert_eq!(types, ["u", "a(ssssssouso)"]);
 ```
!*/

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;


/// Signatures longer than this are rejected outright.
pub const MAX_SIGNATURE_LEN: usize = 255;

/// Array containers may nest at most this deep.
pub const MAX_ARRAY_DEPTH: usize = 32;

/// Struct and dict-entry containers may nest at most this deep.
pub const MAX_STRUCT_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("unknown type code '{0}'")]
    UnknownTypeCode(char),
    #[error("unterminated container in '{0}'")]
    UnterminatedContainer(String),
    #[error("empty struct in '{0}'")]
    EmptyStruct(String),
    #[error("dict entry key must be a basic type")]
    DictEntryKeyNotBasic,
    #[error("dict entry must hold exactly one key and one value")]
    DictEntryArity,
    #[error("dict entry is only valid as an array element")]
    BareDictEntry,
    #[error("container nesting deeper than {0} levels")]
    DepthExceeded(usize),
    #[error("signature longer than 255 bytes")]
    TooLong,
    #[error("a complete type is required")]
    MissingType,
}

pub type Result<T> = std::result::Result<T, Error>;

/// True for the twelve fixed basic type codes. Variants and containers are
/// not basic.
pub fn is_basic(code: u8) -> bool {
    matches!(
        code,
        b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b's' | b'o' | b'g'
    )
}

/// Marshaling alignment of a type, keyed by its first signature code.
pub fn alignment_of(code: u8) -> usize {
    match code {
        b'y' | b'g' | b'v' => 1,
        b'n' | b'q' => 2,
        b'b' | b'i' | b'u' | b's' | b'o' | b'a' => 4,
        b'x' | b't' | b'd' | b'(' | b'{' => 8,
        _ => 1,
    }
}

/// Marshaled size of a fixed-size type. Strings, signatures and all
/// containers are variable-size and return `None`.
pub fn fixed_size_of(code: u8) -> Option<usize> {
    match code {
        b'y' => Some(1),
        b'n' | b'q' => Some(2),
        b'b' | b'i' | b'u' => Some(4),
        b'x' | b't' | b'd' => Some(8),
        _ => None,
    }
}

/// Byte length of the first complete type in `sig`.
///
/// Rejects unknown codes, unterminated containers, empty structs, dict
/// entries outside arrays and nesting beyond the depth limits. Characters
/// past the first complete type are not looked at, so a syntax error in a
/// later type surfaces only once the caller advances to it.
pub fn single_type_len(sig: &str) -> Result<usize> {
    let bytes = sig.as_bytes();
    if bytes.is_empty() {
        return Err(Error::MissingType);
    }
    type_len(bytes, sig, 0, 0, 0, false)
}

/// True if `sig` is exactly one complete type.
pub fn is_single_type(sig: &str) -> bool {
    matches!(single_type_len(sig), Ok(n) if n == sig.len())
}

/// Validate a whole signature: zero or more complete types.
pub fn validate(sig: &str) -> Result<()> {
    if sig.len() > MAX_SIGNATURE_LEN {
        return Err(Error::TooLong);
    }
    let mut pos = 0;
    while pos < sig.len() {
        pos += single_type_len(&sig[pos..])?;
    }
    Ok(())
}

fn type_len(
    bytes: &[u8],
    whole: &str,
    pos: usize,
    adepth: usize,
    sdepth: usize,
    in_array: bool,
) -> Result<usize> {
    let code = match bytes.get(pos) {
        Some(c) => *c,
        None => return Err(Error::UnterminatedContainer(whole.into())),
    };
    if is_basic(code) || code == b'v' {
        return Ok(1);
    }
    match code {
        b'a' => {
            if adepth + 1 > MAX_ARRAY_DEPTH {
                return Err(Error::DepthExceeded(MAX_ARRAY_DEPTH));
            }
            let elem = type_len(bytes, whole, pos + 1, adepth + 1, sdepth, true)?;
            Ok(1 + elem)
        }
        b'(' => {
            if sdepth + 1 > MAX_STRUCT_DEPTH {
                return Err(Error::DepthExceeded(MAX_STRUCT_DEPTH));
            }
            let mut at = pos + 1;
            let mut fields = 0;
            loop {
                match bytes.get(at) {
                    None => return Err(Error::UnterminatedContainer(whole.into())),
                    Some(b')') => {
                        if fields == 0 {
                            return Err(Error::EmptyStruct(whole.into()));
                        }
                        return Ok(at + 1 - pos);
                    }
                    Some(_) => {
                        at += type_len(bytes, whole, at, adepth, sdepth + 1, false)?;
                        fields += 1;
                    }
                }
            }
        }
        b'{' => {
            if !in_array {
                return Err(Error::BareDictEntry);
            }
            if sdepth + 1 > MAX_STRUCT_DEPTH {
                return Err(Error::DepthExceeded(MAX_STRUCT_DEPTH));
            }
            let key = match bytes.get(pos + 1) {
                None => return Err(Error::UnterminatedContainer(whole.into())),
                Some(b'}') => return Err(Error::DictEntryArity),
                Some(c) => *c,
            };
            if !is_basic(key) {
                return Err(Error::DictEntryKeyNotBasic);
            }
            let mut at = pos + 2;
            match bytes.get(at) {
                None => return Err(Error::UnterminatedContainer(whole.into())),
                Some(b'}') => return Err(Error::DictEntryArity),
                Some(_) => at += type_len(bytes, whole, at, adepth, sdepth + 1, false)?,
            }
            match bytes.get(at) {
                Some(b'}') => Ok(at + 1 - pos),
                Some(_) => Err(Error::DictEntryArity),
                None => Err(Error::UnterminatedContainer(whole.into())),
            }
        }
        other => Err(Error::UnknownTypeCode(other as char)),
    }
}

/// Iterator over the complete types of a multi-type signature.
///
/// Yields one `&str` slice per complete type. Splitting is lazy: types in
/// front of a syntax error are yielded normally, then the error itself, then
/// the iterator ends.
pub struct SignatureIter<'a> {
    sig: &'a str,
    pos: usize,
}

impl<'a> SignatureIter<'a> {
    pub fn new(sig: &'a str) -> Self {
        SignatureIter { sig, pos: 0 }
    }
}

impl<'a> Iterator for SignatureIter<'a> {
    type Item = Result<&'a str>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.sig.len() {
            return None;
        }
        match single_type_len(&self.sig[self.pos..]) {
            Ok(n) => {
                let one = &self.sig[self.pos..self.pos + n];
                self.pos += n;
                Some(Ok(one))
            }
            Err(e) => {
                self.pos = self.sig.len();
                Some(Err(e))
            }
        }
    }
}

/// An owned, validated type signature: zero or more complete types, at most
/// [`MAX_SIGNATURE_LEN`] bytes. The empty signature is valid and describes a
/// message without arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Signature(String);

impl Signature {
    pub fn new<S: Into<String>>(sig: S) -> Result<Self> {
        let sig = sig.into();
        validate(&sig)?;
        Ok(Signature(sig))
    }

    pub fn empty() -> Self {
        Signature(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn iter(&self) -> SignatureIter<'_> {
        SignatureIter::new(&self.0)
    }

    /// True if the signature is exactly one complete type, as required for
    /// variant contents and array elements.
    pub fn is_single(&self) -> bool {
        is_single_type(&self.0)
    }
}

impl FromStr for Signature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Signature::new(s)
    }
}

impl Deref for Signature {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Signature {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}
