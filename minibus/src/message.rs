//! Bus messages: an owned buffer-plus-cursor object, either being composed
//! for sending or being read as a received reply.
//!
//! Marshaling is little-endian with natural alignment relative to the body
//! start. Strings and object paths are u32-length-prefixed and
//! NUL-terminated, signatures are u8-length-prefixed, arrays carry a u32
//! byte length followed by padding to the element alignment, structs and
//! dict entries align to 8, variants embed the contained type's signature
//! before the value.

use std::ops::Range;

use bytes::{BufMut, BytesMut};
use minibus_parser::{alignment_of, is_single_type, single_type_len, validate, MAX_SIGNATURE_LEN};

use crate::error::{Error, Result};
use crate::value::{check_name, check_object_path, is_valid_object_path, Value};

/// Arrays longer than this many marshaled bytes are rejected on decode.
pub(crate) const MAX_ARRAY_LEN: usize = 1 << 26;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    MethodCall,
    MethodReturn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Struct,
    Array,
    Variant,
    DictEntry,
}

/// Outcome of one read operation inside a message or container.
///
/// `End` is the designed loop terminator for arrays (and for the message
/// body at the top level); failures travel separately as `Err`, so callers
/// cannot conflate "no more elements" with "something broke".
#[derive(Debug, Clone, PartialEq)]
pub enum ReadResult<T> {
    Value(T),
    End,
}

impl<T> ReadResult<T> {
    pub fn is_end(&self) -> bool {
        matches!(self, ReadResult::End)
    }

    pub fn value(self) -> Option<T> {
        match self {
            ReadResult::Value(v) => Some(v),
            ReadResult::End => None,
        }
    }
}

#[derive(Debug)]
struct ComposeFrame {
    kind: ContainerKind,
    contents: String,
    /// Consumed offset into `contents` (structs, dict entries, variants).
    offset: usize,
    /// Array only: index of the u32 length slot in the body.
    len_slot: usize,
    /// Array only: body offset where element data starts.
    start: usize,
}

#[derive(Debug)]
struct ReadFrame {
    kind: ContainerKind,
    contents: String,
    offset: usize,
    /// Array only: absolute body offset one past the last element.
    end: usize,
}

#[derive(Debug)]
pub struct Message {
    kind: MessageKind,
    pub(crate) serial: u32,
    pub(crate) reply_serial: u32,
    pub(crate) destination: Option<String>,
    pub(crate) path: Option<String>,
    pub(crate) interface: Option<String>,
    pub(crate) member: Option<String>,
    pub(crate) error_name: Option<String>,
    pub(crate) signature: String,
    pub(crate) body: BytesMut,
    compose: Vec<ComposeFrame>,
    rpos: usize,
    rsig_pos: usize,
    rstack: Vec<ReadFrame>,
    last_errno: i32,
}

impl Message {
    fn new(kind: MessageKind) -> Message {
        Message {
            kind,
            serial: 0,
            reply_serial: 0,
            destination: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            signature: String::new(),
            body: BytesMut::new(),
            compose: Vec::new(),
            rpos: 0,
            rsig_pos: 0,
            rstack: Vec::new(),
            last_errno: 0,
        }
    }

    pub(crate) fn method_call(
        destination: &str,
        path: &str,
        interface: &str,
        member: &str,
    ) -> Result<Message> {
        check_name("destination", destination)?;
        check_name("path", path)?;
        check_object_path(path)?;
        check_name("interface", interface)?;
        check_name("member", member)?;
        let mut m = Message::new(MessageKind::MethodCall);
        m.destination = Some(destination.into());
        m.path = Some(path.into());
        m.interface = Some(interface.into());
        m.member = Some(member.into());
        Ok(m)
    }

    /// Build an empty reply to `call`, carrying its serial.
    pub fn new_method_return(call: &Message) -> Result<Message> {
        if call.kind != MessageKind::MethodCall {
            return Err(Error::InvalidArgument(
                "reply to a message that is not a method call".into(),
            ));
        }
        let mut m = Message::new(MessageKind::MethodReturn);
        m.reply_serial = call.serial;
        Ok(m)
    }

    /// Build an error reply to `call` with a symbolic error name and a
    /// human-readable message string as the body.
    pub fn new_error(call: &Message, name: &str, message: &str) -> Result<Message> {
        if call.kind != MessageKind::MethodCall {
            return Err(Error::InvalidArgument(
                "reply to a message that is not a method call".into(),
            ));
        }
        check_name("error name", name)?;
        let mut m = Message::new(MessageKind::Error);
        m.reply_serial = call.serial;
        m.error_name = Some(name.into());
        m.append("s", &[Value::Str(message.into())])?;
        Ok(m)
    }

    pub(crate) fn from_wire(
        kind: MessageKind,
        serial: u32,
        reply_serial: u32,
        destination: Option<String>,
        path: Option<String>,
        interface: Option<String>,
        member: Option<String>,
        error_name: Option<String>,
        signature: String,
        body: BytesMut,
    ) -> Result<Message> {
        validate(&signature)?;
        let mut m = Message::new(kind);
        m.serial = serial;
        m.reply_serial = reply_serial;
        m.destination = destination;
        m.path = path;
        m.interface = interface;
        m.member = member;
        m.error_name = error_name;
        m.signature = signature;
        m.body = body;
        Ok(m)
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn member(&self) -> Option<&str> {
        self.member.as_deref()
    }

    pub fn error_name(&self) -> Option<&str> {
        self.error_name.as_deref()
    }

    /// The accumulated (composition) or declared (received) body signature.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Numeric code of the most recent failed operation on this message,
    /// 0 if none.
    pub fn last_errno(&self) -> i32 {
        self.last_errno
    }

    pub(crate) fn has_open_containers(&self) -> bool {
        !self.compose.is_empty()
    }

    /// Release the message. Consuming `self` makes a second release
    /// unrepresentable; dropping the message is equivalent.
    pub fn release(self) {}

    fn wrap<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        match f(self) {
            Err(e) => {
                self.last_errno = e.errno();
                tracing::trace!(errno = self.last_errno, error = %e, "message operation failed");
                Err(e)
            }
            ok => ok,
        }
    }

    // ---- composition ----

    /// Append one value per complete type of `signature`, in order.
    ///
    /// The signature is validated lazily, one complete type at a time:
    /// values in front of a syntax error stay appended and the error
    /// surfaces where the offending code is reached. A value that does not
    /// match its declared code fails with [`Error::TypeMismatch`].
    pub fn append(&mut self, signature: &str, values: &[Value]) -> Result<()> {
        self.wrap(|m| {
            let mut idx = 0;
            let mut pos = 0;
            while pos < signature.len() {
                let n = single_type_len(&signature[pos..])?;
                let one = &signature[pos..pos + n];
                let v = values.get(idx).ok_or_else(|| {
                    Error::InvalidArgument(format!("no value for type '{}'", one))
                })?;
                m.claim_compose_slot(one)?;
                m.encode_value(one, v)?;
                pos += n;
                idx += 1;
            }
            if idx != values.len() {
                return Err(Error::InvalidArgument(format!(
                    "{} values passed for {} types",
                    values.len(),
                    idx
                )));
            }
            Ok(())
        })
    }

    /// Begin a nested container whose element/field shape is `contents`.
    /// Every open must be matched by exactly one [`close_container`] in
    /// LIFO order.
    ///
    /// [`close_container`]: Message::close_container
    pub fn open_container(&mut self, kind: ContainerKind, contents: &str) -> Result<()> {
        self.wrap(|m| {
            let full = container_signature(kind, contents)?;
            if kind == ContainerKind::DictEntry
                && !matches!(
                    m.compose.last(),
                    Some(f) if f.kind == ContainerKind::Array
                )
            {
                return Err(Error::Signature(minibus_parser::Error::BareDictEntry));
            }
            m.claim_compose_slot(&full)?;
            let mut frame = ComposeFrame {
                kind,
                contents: contents.into(),
                offset: 0,
                len_slot: 0,
                start: 0,
            };
            match kind {
                ContainerKind::Array => {
                    m.pad_to(4);
                    frame.len_slot = m.body.len();
                    m.body.put_u32_le(0);
                    m.pad_to(alignment_of(contents.as_bytes()[0]));
                    frame.start = m.body.len();
                }
                ContainerKind::Struct | ContainerKind::DictEntry => {
                    m.pad_to(8);
                }
                ContainerKind::Variant => {
                    m.encode_sig(contents)?;
                }
            }
            m.compose.push(frame);
            Ok(())
        })
    }

    /// End the innermost open container. Structs and dict entries must have
    /// all declared fields appended, variants exactly one value; arrays may
    /// close at any element count (including zero).
    pub fn close_container(&mut self) -> Result<()> {
        self.wrap(|m| {
            let f = match m.compose.pop() {
                Some(f) => f,
                None => return Err(Error::NoContainer),
            };
            let incomplete = match f.kind {
                ContainerKind::Array => false,
                ContainerKind::Struct | ContainerKind::DictEntry => f.offset < f.contents.len(),
                ContainerKind::Variant => f.offset == 0,
            };
            if incomplete {
                m.compose.push(f);
                return Err(Error::IncompleteContainer);
            }
            if f.kind == ContainerKind::Array {
                let len = m.body.len() - f.start;
                if len > MAX_ARRAY_LEN {
                    return Err(Error::BadMessage("array too long"));
                }
                m.body[f.len_slot..f.len_slot + 4].copy_from_slice(&(len as u32).to_le_bytes());
            }
            Ok(())
        })
    }

    fn claim_compose_slot(&mut self, one: &str) -> Result<()> {
        match self.compose.last_mut() {
            None => {
                if self.signature.len() + one.len() > MAX_SIGNATURE_LEN {
                    return Err(Error::Signature(minibus_parser::Error::TooLong));
                }
                self.signature.push_str(one);
                Ok(())
            }
            Some(f) => match f.kind {
                ContainerKind::Array => {
                    if one == f.contents {
                        Ok(())
                    } else {
                        Err(Error::TypeMismatch {
                            expected: f.contents.clone(),
                            found: one.into(),
                        })
                    }
                }
                ContainerKind::Struct | ContainerKind::DictEntry => {
                    let rem = &f.contents[f.offset..];
                    if rem.is_empty() {
                        return Err(Error::ContainerFull);
                    }
                    let n = single_type_len(rem)?;
                    if &rem[..n] != one {
                        return Err(Error::TypeMismatch {
                            expected: rem[..n].into(),
                            found: one.into(),
                        });
                    }
                    f.offset += n;
                    Ok(())
                }
                ContainerKind::Variant => {
                    if f.offset > 0 {
                        return Err(Error::ContainerFull);
                    }
                    if one == f.contents {
                        f.offset = f.contents.len();
                        Ok(())
                    } else {
                        Err(Error::TypeMismatch {
                            expected: f.contents.clone(),
                            found: one.into(),
                        })
                    }
                }
            },
        }
    }

    fn encode_value(&mut self, sig: &str, v: &Value) -> Result<()> {
        let code = sig.as_bytes()[0];
        match (code, v) {
            (b'y', Value::Byte(x)) => {
                self.body.put_u8(*x);
                Ok(())
            }
            (b'b', Value::Bool(x)) => {
                self.pad_to(4);
                self.body.put_u32_le(*x as u32);
                Ok(())
            }
            (b'n', Value::Int16(x)) => {
                self.pad_to(2);
                self.body.put_i16_le(*x);
                Ok(())
            }
            (b'q', Value::Uint16(x)) => {
                self.pad_to(2);
                self.body.put_u16_le(*x);
                Ok(())
            }
            (b'i', Value::Int32(x)) => {
                self.pad_to(4);
                self.body.put_i32_le(*x);
                Ok(())
            }
            (b'u', Value::Uint32(x)) => {
                self.pad_to(4);
                self.body.put_u32_le(*x);
                Ok(())
            }
            (b'x', Value::Int64(x)) => {
                self.pad_to(8);
                self.body.put_i64_le(*x);
                Ok(())
            }
            (b't', Value::Uint64(x)) => {
                self.pad_to(8);
                self.body.put_u64_le(*x);
                Ok(())
            }
            (b'd', Value::Double(x)) => {
                self.pad_to(8);
                self.body.put_f64_le(*x);
                Ok(())
            }
            (b's', Value::Str(s)) => self.encode_str(s),
            (b'o', Value::ObjectPath(p)) => {
                check_object_path(p)?;
                self.encode_str(p)
            }
            (b'g', Value::Signature(s)) => self.encode_sig(s),
            (b'a', Value::Array { element, values }) => {
                let elem = &sig[1..];
                if element != elem {
                    return Err(Error::TypeMismatch {
                        expected: elem.into(),
                        found: format!("array of '{}'", element),
                    });
                }
                self.pad_to(4);
                let len_slot = self.body.len();
                self.body.put_u32_le(0);
                self.pad_to(alignment_of(elem.as_bytes()[0]));
                let start = self.body.len();
                for item in values {
                    self.encode_value(elem, item)?;
                }
                let len = self.body.len() - start;
                if len > MAX_ARRAY_LEN {
                    return Err(Error::BadMessage("array too long"));
                }
                self.body[len_slot..len_slot + 4].copy_from_slice(&(len as u32).to_le_bytes());
                Ok(())
            }
            (b'(', Value::Struct(fields)) => {
                let contents = &sig[1..sig.len() - 1];
                self.pad_to(8);
                let mut pos = 0;
                let mut idx = 0;
                while pos < contents.len() {
                    let n = single_type_len(&contents[pos..])?;
                    let field = fields.get(idx).ok_or_else(|| Error::TypeMismatch {
                        expected: sig.into(),
                        found: format!("struct with {} fields", fields.len()),
                    })?;
                    self.encode_value(&contents[pos..pos + n], field)?;
                    pos += n;
                    idx += 1;
                }
                if idx != fields.len() {
                    return Err(Error::TypeMismatch {
                        expected: sig.into(),
                        found: format!("struct with {} fields", fields.len()),
                    });
                }
                Ok(())
            }
            (b'{', Value::DictEntry(key, val)) => {
                let contents = &sig[1..sig.len() - 1];
                self.pad_to(8);
                let klen = single_type_len(contents)?;
                self.encode_value(&contents[..klen], key)?;
                self.encode_value(&contents[klen..], val)?;
                Ok(())
            }
            (b'v', Value::Variant(inner)) => {
                let contained = inner.signature();
                self.encode_sig(&contained)?;
                self.encode_value(&contained, inner)
            }
            (_, other) => Err(Error::TypeMismatch {
                expected: sig.into(),
                found: other.type_name().into(),
            }),
        }
    }

    fn encode_str(&mut self, s: &str) -> Result<()> {
        if s.contains('\0') {
            return Err(Error::InvalidArgument("string contains NUL".into()));
        }
        self.pad_to(4);
        self.body.put_u32_le(s.len() as u32);
        self.body.put_slice(s.as_bytes());
        self.body.put_u8(0);
        Ok(())
    }

    fn encode_sig(&mut self, s: &str) -> Result<()> {
        validate(s)?;
        self.body.put_u8(s.len() as u8);
        self.body.put_slice(s.as_bytes());
        self.body.put_u8(0);
        Ok(())
    }

    fn pad_to(&mut self, align: usize) {
        while self.body.len() % align != 0 {
            self.body.put_u8(0);
        }
    }

    // ---- reading ----

    /// Reset the read cursor to the body start. A freshly composed message
    /// becomes readable; replies arrive already rewound.
    pub fn rewind(&mut self) {
        self.rpos = 0;
        self.rsig_pos = 0;
        self.rstack.clear();
    }

    /// Decode the next value(s) per `signature`, advancing the cursor.
    ///
    /// Returns [`ReadResult::End`] with nothing decoded at the end of an
    /// entered array (or of the message body at the top level).
    pub fn read(&mut self, signature: &str) -> Result<ReadResult<Vec<Value>>> {
        self.wrap(|m| {
            let mut out = Vec::new();
            let mut pos = 0;
            while pos < signature.len() {
                let n = single_type_len(&signature[pos..])?;
                let one = &signature[pos..pos + n];
                if !m.begin_read_one(one)? {
                    if pos == 0 {
                        return Ok(ReadResult::End);
                    }
                    return Err(Error::ReadPastEnd);
                }
                out.push(m.decode_value(one)?);
                m.check_array_bounds()?;
                pos += n;
            }
            Ok(ReadResult::Value(out))
        })
    }

    /// Position the cursor at the first element of the next container.
    ///
    /// For arrays this yields [`ReadResult::End`] when the enclosing array
    /// has no further elements. Entering a variant requires `contents` to
    /// equal the contained type's signature.
    pub fn enter_container(
        &mut self,
        kind: ContainerKind,
        contents: &str,
    ) -> Result<ReadResult<()>> {
        self.wrap(|m| {
            let full = container_signature(kind, contents)?;
            if kind == ContainerKind::DictEntry
                && !matches!(
                    m.rstack.last(),
                    Some(f) if f.kind == ContainerKind::Array
                )
            {
                return Err(Error::Signature(minibus_parser::Error::BareDictEntry));
            }
            if !m.begin_read_one(&full)? {
                return Ok(ReadResult::End);
            }
            let frame = match kind {
                ContainerKind::Array => {
                    m.ralign(4)?;
                    let r = m.take(4)?;
                    let len = m.u32_at(r.start) as usize;
                    if len > MAX_ARRAY_LEN {
                        return Err(Error::BadMessage("array too long"));
                    }
                    m.ralign(alignment_of(contents.as_bytes()[0]))?;
                    let end = m.rpos + len;
                    if end > m.body.len() {
                        return Err(Error::BadMessage("truncated message"));
                    }
                    ReadFrame {
                        kind,
                        contents: contents.into(),
                        offset: 0,
                        end,
                    }
                }
                ContainerKind::Struct | ContainerKind::DictEntry => {
                    m.ralign(8)?;
                    ReadFrame {
                        kind,
                        contents: contents.into(),
                        offset: 0,
                        end: 0,
                    }
                }
                ContainerKind::Variant => {
                    let r = m.decode_str_range(true)?;
                    let contained = m.str_at(r)?.to_string();
                    if !is_single_type(&contained) {
                        return Err(Error::BadMessage("invalid variant signature"));
                    }
                    if contained != contents {
                        return Err(Error::TypeMismatch {
                            expected: contained,
                            found: contents.into(),
                        });
                    }
                    ReadFrame {
                        kind,
                        contents: contained,
                        offset: 0,
                        end: 0,
                    }
                }
            };
            m.rstack.push(frame);
            Ok(ReadResult::Value(()))
        })
    }

    /// Leave the innermost entered container. Arrays must be consumed to
    /// their end, structs/dict entries/variants to their last field.
    pub fn exit_container(&mut self) -> Result<()> {
        self.wrap(|m| {
            let f = match m.rstack.pop() {
                Some(f) => f,
                None => return Err(Error::NoContainer),
            };
            let consumed = match f.kind {
                ContainerKind::Array => m.rpos == f.end,
                _ => f.offset >= f.contents.len(),
            };
            if !consumed {
                m.rstack.push(f);
                return Err(Error::ContainerNotConsumed);
            }
            Ok(())
        })
    }

    /// The next complete type at the cursor: its first code and, for
    /// containers other than variants, the contents signature. `None` at
    /// the end of the current container or body.
    pub fn peek_type(&self) -> Result<Option<(char, Option<&str>)>> {
        let rem: &str = match self.rstack.last() {
            None => &self.signature[self.rsig_pos..],
            Some(f) => match f.kind {
                ContainerKind::Array => {
                    if self.rpos >= f.end {
                        return Ok(None);
                    }
                    &f.contents
                }
                _ => &f.contents[f.offset..],
            },
        };
        if rem.is_empty() {
            return Ok(None);
        }
        let n = single_type_len(rem)?;
        let one = &rem[..n];
        let code = one.as_bytes()[0] as char;
        let contents = match code {
            'a' => Some(&one[1..]),
            '(' | '{' => Some(&one[1..one.len() - 1]),
            _ => None,
        };
        Ok(Some((code, contents)))
    }

    pub fn read_byte(&mut self) -> Result<ReadResult<u8>> {
        self.read_fixed("y", 1, |b| b[0])
    }

    pub fn read_bool(&mut self) -> Result<ReadResult<bool>> {
        self.wrap(|m| {
            if !m.begin_read_one("b")? {
                return Ok(ReadResult::End);
            }
            m.ralign(4)?;
            let r = m.take(4)?;
            match m.u32_at(r.start) {
                0 => Ok(ReadResult::Value(false)),
                1 => Ok(ReadResult::Value(true)),
                _ => Err(Error::BadMessage("boolean out of range")),
            }
        })
    }

    pub fn read_i16(&mut self) -> Result<ReadResult<i16>> {
        self.read_fixed("n", 2, |b| i16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u16(&mut self) -> Result<ReadResult<u16>> {
        self.read_fixed("q", 2, |b| u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_i32(&mut self) -> Result<ReadResult<i32>> {
        self.read_fixed("i", 4, |b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u32(&mut self) -> Result<ReadResult<u32>> {
        self.read_fixed("u", 4, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i64(&mut self) -> Result<ReadResult<i64>> {
        self.read_fixed("x", 8, |b| {
            i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        })
    }

    pub fn read_u64(&mut self) -> Result<ReadResult<u64>> {
        self.read_fixed("t", 8, |b| {
            u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        })
    }

    pub fn read_f64(&mut self) -> Result<ReadResult<f64>> {
        self.read_fixed("d", 8, |b| {
            f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        })
    }

    /// Read a string. The returned `&str` is borrowed from the message's
    /// internal buffer; the borrow ends at the next operation on the
    /// message.
    pub fn read_str(&mut self) -> Result<ReadResult<&str>> {
        match self.read_str_slot("s")? {
            ReadResult::End => Ok(ReadResult::End),
            ReadResult::Value(r) => Ok(ReadResult::Value(self.str_at(r)?)),
        }
    }

    pub fn read_object_path(&mut self) -> Result<ReadResult<&str>> {
        match self.read_str_slot("o")? {
            ReadResult::End => Ok(ReadResult::End),
            ReadResult::Value(r) => Ok(ReadResult::Value(self.str_at(r)?)),
        }
    }

    pub fn read_signature(&mut self) -> Result<ReadResult<&str>> {
        match self.read_str_slot("g")? {
            ReadResult::End => Ok(ReadResult::End),
            ReadResult::Value(r) => Ok(ReadResult::Value(self.str_at(r)?)),
        }
    }

    fn read_fixed<T, F>(&mut self, one: &str, width: usize, decode: F) -> Result<ReadResult<T>>
    where
        F: FnOnce(&[u8]) -> T,
    {
        self.wrap(|m| {
            if !m.begin_read_one(one)? {
                return Ok(ReadResult::End);
            }
            m.ralign(alignment_of(one.as_bytes()[0]))?;
            let r = m.take(width)?;
            Ok(ReadResult::Value(decode(&m.body[r])))
        })
    }

    fn read_str_slot(&mut self, one: &'static str) -> Result<ReadResult<Range<usize>>> {
        let r = self.read_str_slot_inner(one);
        if let Err(e) = &r {
            self.last_errno = e.errno();
            tracing::trace!(errno = self.last_errno, error = %e, "message operation failed");
        }
        r
    }

    fn read_str_slot_inner(&mut self, one: &'static str) -> Result<ReadResult<Range<usize>>> {
        if !self.begin_read_one(one)? {
            return Ok(ReadResult::End);
        }
        let range = self.decode_str_range(one == "g")?;
        match one {
            "o" => {
                if !is_valid_object_path(self.str_at(range.clone())?) {
                    return Err(Error::BadMessage("invalid object path"));
                }
            }
            "g" => {
                if validate(self.str_at(range.clone())?).is_err() {
                    return Err(Error::BadMessage("invalid signature"));
                }
            }
            _ => {}
        }
        Ok(ReadResult::Value(range))
    }

    /// Claim the next read slot for type `one`. `Ok(false)` means the
    /// current array (or the body at the top level) has no further
    /// elements.
    fn begin_read_one(&mut self, one: &str) -> Result<bool> {
        let n = single_type_len(one)?;
        if n != one.len() {
            return Err(Error::InvalidArgument(
                "read type must be a single complete type".into(),
            ));
        }
        match self.rstack.last_mut() {
            None => {
                let rem = &self.signature[self.rsig_pos..];
                if rem.is_empty() {
                    return Ok(false);
                }
                let want = single_type_len(rem)?;
                if &rem[..want] != one {
                    return Err(Error::TypeMismatch {
                        expected: rem[..want].into(),
                        found: one.into(),
                    });
                }
                self.rsig_pos += want;
                Ok(true)
            }
            Some(f) => match f.kind {
                ContainerKind::Array => {
                    if self.rpos >= f.end {
                        return Ok(false);
                    }
                    if one != f.contents {
                        return Err(Error::TypeMismatch {
                            expected: f.contents.clone(),
                            found: one.into(),
                        });
                    }
                    Ok(true)
                }
                _ => {
                    let rem = &f.contents[f.offset..];
                    if rem.is_empty() {
                        return Err(Error::ReadPastEnd);
                    }
                    let want = single_type_len(rem)?;
                    if &rem[..want] != one {
                        return Err(Error::TypeMismatch {
                            expected: rem[..want].into(),
                            found: one.into(),
                        });
                    }
                    f.offset += want;
                    Ok(true)
                }
            },
        }
    }

    fn decode_value(&mut self, sig: &str) -> Result<Value> {
        let code = sig.as_bytes()[0];
        match code {
            b'y' => {
                let r = self.take(1)?;
                Ok(Value::Byte(self.body[r.start]))
            }
            b'b' => {
                self.ralign(4)?;
                let r = self.take(4)?;
                match self.u32_at(r.start) {
                    0 => Ok(Value::Bool(false)),
                    1 => Ok(Value::Bool(true)),
                    _ => Err(Error::BadMessage("boolean out of range")),
                }
            }
            b'n' => {
                self.ralign(2)?;
                let r = self.take(2)?;
                let b = &self.body[r];
                Ok(Value::Int16(i16::from_le_bytes([b[0], b[1]])))
            }
            b'q' => {
                self.ralign(2)?;
                let r = self.take(2)?;
                let b = &self.body[r];
                Ok(Value::Uint16(u16::from_le_bytes([b[0], b[1]])))
            }
            b'i' => {
                self.ralign(4)?;
                let r = self.take(4)?;
                let b = &self.body[r];
                Ok(Value::Int32(i32::from_le_bytes([b[0], b[1], b[2], b[3]])))
            }
            b'u' => {
                self.ralign(4)?;
                let r = self.take(4)?;
                Ok(Value::Uint32(self.u32_at(r.start)))
            }
            b'x' => {
                self.ralign(8)?;
                let r = self.take(8)?;
                let b = &self.body[r];
                Ok(Value::Int64(i64::from_le_bytes([
                    b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
                ])))
            }
            b't' => {
                self.ralign(8)?;
                let r = self.take(8)?;
                let b = &self.body[r];
                Ok(Value::Uint64(u64::from_le_bytes([
                    b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
                ])))
            }
            b'd' => {
                self.ralign(8)?;
                let r = self.take(8)?;
                let b = &self.body[r];
                Ok(Value::Double(f64::from_le_bytes([
                    b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
                ])))
            }
            b's' => {
                let r = self.decode_str_range(false)?;
                Ok(Value::Str(self.str_at(r)?.to_string()))
            }
            b'o' => {
                let r = self.decode_str_range(false)?;
                let s = self.str_at(r)?;
                if !is_valid_object_path(s) {
                    return Err(Error::BadMessage("invalid object path"));
                }
                Ok(Value::ObjectPath(s.to_string()))
            }
            b'g' => {
                let r = self.decode_str_range(true)?;
                let s = self.str_at(r)?;
                if validate(s).is_err() {
                    return Err(Error::BadMessage("invalid signature"));
                }
                Ok(Value::Signature(s.to_string()))
            }
            b'a' => {
                let elem = &sig[1..];
                self.ralign(4)?;
                let r = self.take(4)?;
                let len = self.u32_at(r.start) as usize;
                if len > MAX_ARRAY_LEN {
                    return Err(Error::BadMessage("array too long"));
                }
                self.ralign(alignment_of(elem.as_bytes()[0]))?;
                let end = self.rpos + len;
                if end > self.body.len() {
                    return Err(Error::BadMessage("truncated message"));
                }
                let mut values = Vec::new();
                while self.rpos < end {
                    values.push(self.decode_value(elem)?);
                    if self.rpos > end {
                        return Err(Error::BadMessage("array element overrun"));
                    }
                }
                Ok(Value::Array {
                    element: elem.to_string(),
                    values,
                })
            }
            b'(' => {
                let contents = &sig[1..sig.len() - 1];
                self.ralign(8)?;
                let mut fields = Vec::new();
                let mut pos = 0;
                while pos < contents.len() {
                    let n = single_type_len(&contents[pos..])?;
                    fields.push(self.decode_value(&contents[pos..pos + n])?);
                    pos += n;
                }
                Ok(Value::Struct(fields))
            }
            b'{' => {
                let contents = &sig[1..sig.len() - 1];
                self.ralign(8)?;
                let klen = single_type_len(contents)?;
                let key = self.decode_value(&contents[..klen])?;
                let val = self.decode_value(&contents[klen..])?;
                Ok(Value::DictEntry(Box::new(key), Box::new(val)))
            }
            b'v' => {
                let r = self.decode_str_range(true)?;
                let contained = self.str_at(r)?.to_string();
                if !is_single_type(&contained) {
                    return Err(Error::BadMessage("invalid variant signature"));
                }
                let inner = self.decode_value(&contained)?;
                Ok(Value::Variant(Box::new(inner)))
            }
            other => Err(Error::Signature(minibus_parser::Error::UnknownTypeCode(
                other as char,
            ))),
        }
    }

    fn decode_str_range(&mut self, sigform: bool) -> Result<Range<usize>> {
        let len = if sigform {
            let r = self.take(1)?;
            self.body[r.start] as usize
        } else {
            self.ralign(4)?;
            let r = self.take(4)?;
            self.u32_at(r.start) as usize
        };
        let r = self.take(len + 1)?;
        let data = r.start..r.end - 1;
        if self.body[r.end - 1] != 0 {
            return Err(Error::BadMessage("string not NUL-terminated"));
        }
        let bytes = &self.body[data.clone()];
        if bytes.contains(&0) {
            return Err(Error::BadMessage("string contains NUL"));
        }
        if std::str::from_utf8(bytes).is_err() {
            return Err(Error::BadMessage("invalid UTF-8"));
        }
        Ok(data)
    }

    fn str_at(&self, r: Range<usize>) -> Result<&str> {
        std::str::from_utf8(&self.body[r]).map_err(|_| Error::BadMessage("invalid UTF-8"))
    }

    fn u32_at(&self, at: usize) -> u32 {
        let b = &self.body[at..at + 4];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    fn take(&mut self, n: usize) -> Result<Range<usize>> {
        let start = self.rpos;
        let end = match start.checked_add(n) {
            Some(end) if end <= self.body.len() => end,
            _ => return Err(Error::BadMessage("truncated message")),
        };
        self.rpos = end;
        Ok(start..end)
    }

    fn ralign(&mut self, align: usize) -> Result<()> {
        let target = (self.rpos + align - 1) / align * align;
        if target > self.body.len() {
            return Err(Error::BadMessage("truncated message"));
        }
        if self.body[self.rpos..target].iter().any(|&b| b != 0) {
            return Err(Error::BadMessage("nonzero padding"));
        }
        self.rpos = target;
        Ok(())
    }

    fn check_array_bounds(&self) -> Result<()> {
        if let Some(f) = self.rstack.last() {
            if f.kind == ContainerKind::Array && self.rpos > f.end {
                return Err(Error::BadMessage("array element overrun"));
            }
        }
        Ok(())
    }
}

/// The full signature a container of `kind` with `contents` marshals as,
/// with the container's own structural rules checked.
fn container_signature(kind: ContainerKind, contents: &str) -> Result<String> {
    let full = match kind {
        ContainerKind::Array => format!("a{}", contents),
        ContainerKind::Struct => format!("({})", contents),
        ContainerKind::DictEntry => format!("{{{}}}", contents),
        ContainerKind::Variant => {
            if !is_single_type(contents) {
                return Err(Error::InvalidArgument(
                    "variant contents must be a single complete type".into(),
                ));
            }
            return Ok("v".into());
        }
    };
    let check = match kind {
        ContainerKind::DictEntry => format!("a{}", full),
        _ => full.clone(),
    };
    let n = single_type_len(&check)?;
    if n != check.len() {
        return Err(Error::InvalidArgument(
            "container contents must be complete types".into(),
        ));
    }
    Ok(full)
}
