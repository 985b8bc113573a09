use crate::*;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use static_assertions::{assert_impl_all, assert_not_impl_any};

assert_impl_all!(Message: Send, Sync);
assert_impl_all!(RemoteError: Send, Sync);
assert_impl_all!(Connection: Send);
assert_not_impl_any!(Connection: Sync);

fn compose() -> Message {
    Message::method_call("org.example.Test", "/org/example/Test", "org.example.Test", "Get")
        .unwrap()
}

#[test]
fn test_primitive_round_trips() {
    let mut m = compose();
    m.append(
        "suogybnqixtd",
        &[
            Value::Str("hello world".into()),
            Value::Uint32(4_000_000_000),
            Value::ObjectPath("/org/example/Test".into()),
            Value::Signature("a{sv}".into()),
            Value::Byte(0xA5),
            Value::Bool(true),
            Value::Int16(-12345),
            Value::Uint16(54321),
            Value::Int32(-7),
            Value::Int64(i64::MIN),
            Value::Uint64(u64::MAX),
            Value::Double(2.5),
        ],
    )
    .unwrap();
    assert_eq!(m.signature(), "suogybnqixtd");

    m.rewind();
    assert_eq!(m.read_str().unwrap(), ReadResult::Value("hello world"));
    assert_eq!(m.read_u32().unwrap(), ReadResult::Value(4_000_000_000));
    assert_eq!(
        m.read_object_path().unwrap(),
        ReadResult::Value("/org/example/Test")
    );
    assert_eq!(m.read_signature().unwrap(), ReadResult::Value("a{sv}"));
    assert_eq!(m.read_byte().unwrap(), ReadResult::Value(0xA5));
    assert_eq!(m.read_bool().unwrap(), ReadResult::Value(true));
    assert_eq!(m.read_i16().unwrap(), ReadResult::Value(-12345));
    assert_eq!(m.read_u16().unwrap(), ReadResult::Value(54321));
    assert_eq!(m.read_i32().unwrap(), ReadResult::Value(-7));
    assert_eq!(m.read_i64().unwrap(), ReadResult::Value(i64::MIN));
    assert_eq!(m.read_u64().unwrap(), ReadResult::Value(u64::MAX));
    assert_eq!(m.read_f64().unwrap(), ReadResult::Value(2.5));
    assert!(m.read("s").unwrap().is_end());
}

#[test]
fn test_alignment_byte_then_u32() {
    let mut m = compose();
    m.append("yu", &[Value::Byte(1), Value::Uint32(42)]).unwrap();
    assert_eq!(&m.body[..], &[1, 0, 0, 0, 42, 0, 0, 0]);
}

#[test]
fn test_struct_aligns_to_eight() {
    let mut m = compose();
    m.append(
        "y(yy)",
        &[
            Value::Byte(7),
            Value::Struct(vec![Value::Byte(8), Value::Byte(9)]),
        ],
    )
    .unwrap();
    assert_eq!(&m.body[..], &[7, 0, 0, 0, 0, 0, 0, 0, 8, 9]);

    m.rewind();
    assert_eq!(m.read_byte().unwrap(), ReadResult::Value(7));
    let v = m.read("(yy)").unwrap().value().unwrap();
    assert_eq!(
        v,
        vec![Value::Struct(vec![Value::Byte(8), Value::Byte(9)])]
    );
}

#[test]
fn test_empty_array_of_eight_aligned_elements() {
    let mut m = compose();
    m.open_container(ContainerKind::Array, "t").unwrap();
    m.close_container().unwrap();
    // u32 length, then padding to the element alignment, no elements
    assert_eq!(&m.body[..], &[0, 0, 0, 0, 0, 0, 0, 0]);
    assert_eq!(m.signature(), "at");

    m.rewind();
    assert!(m
        .enter_container(ContainerKind::Array, "t")
        .unwrap()
        .value()
        .is_some());
    assert!(m.read("t").unwrap().is_end());
    m.exit_container().unwrap();
}

#[test]
fn test_array_read_loop_terminates_with_single_end() {
    for n in 0..4u32 {
        let mut m = compose();
        m.open_container(ContainerKind::Array, "u").unwrap();
        for i in 0..n {
            m.append("u", &[Value::Uint32(i)]).unwrap();
        }
        m.close_container().unwrap();

        m.rewind();
        m.enter_container(ContainerKind::Array, "u").unwrap();
        let mut seen = Vec::new();
        loop {
            match m.read_u32().unwrap() {
                ReadResult::Value(v) => seen.push(v),
                ReadResult::End => break,
            }
        }
        assert_eq!(seen, (0..n).collect::<Vec<_>>());
        // the end state is stable
        assert!(m.read_u32().unwrap().is_end());
        m.exit_container().unwrap();
    }
}

#[test]
fn test_variant_round_trip() {
    let inners = [
        Value::Byte(3),
        Value::Bool(false),
        Value::Uint32(11),
        Value::Int64(-1),
        Value::Double(0.25),
        Value::Str("inside".into()),
        Value::ObjectPath("/a/b".into()),
        Value::Signature("uu".into()),
    ];
    for inner in inners.iter() {
        let mut m = compose();
        m.append("v", &[Value::Variant(Box::new(inner.clone()))])
            .unwrap();
        m.rewind();
        let got = m.read("v").unwrap().value().unwrap();
        assert_eq!(got, vec![Value::Variant(Box::new(inner.clone()))]);
    }
}

#[test]
fn test_enter_variant_checks_contained_signature() {
    let mut m = compose();
    m.append("v", &[Value::Variant(Box::new(Value::Uint32(5)))])
        .unwrap();
    m.rewind();
    match m.enter_container(ContainerKind::Variant, "s") {
        Err(Error::TypeMismatch { expected, found }) => {
            assert_eq!(expected, "u");
            assert_eq!(found, "s");
        }
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }

    m.rewind();
    m.enter_container(ContainerKind::Variant, "u").unwrap();
    assert_eq!(m.read_u32().unwrap(), ReadResult::Value(5));
    m.exit_container().unwrap();
}

#[test]
fn test_dictionary_round_trip() {
    let mut m = compose();
    m.open_container(ContainerKind::Array, "{su}").unwrap();
    for (k, v) in [("one", 1u32), ("two", 2)] {
        m.open_container(ContainerKind::DictEntry, "su").unwrap();
        m.append("s", &[Value::Str(k.into())]).unwrap();
        m.append("u", &[Value::Uint32(v)]).unwrap();
        m.close_container().unwrap();
    }
    m.close_container().unwrap();
    assert_eq!(m.signature(), "a{su}");

    m.rewind();
    let got = m.read("a{su}").unwrap().value().unwrap();
    assert_eq!(
        got,
        vec![Value::Array {
            element: "{su}".into(),
            values: vec![
                Value::DictEntry(
                    Box::new(Value::Str("one".into())),
                    Box::new(Value::Uint32(1))
                ),
                Value::DictEntry(
                    Box::new(Value::Str("two".into())),
                    Box::new(Value::Uint32(2))
                ),
            ],
        }]
    );
}

#[test]
fn test_empty_dictionary() {
    let mut m = compose();
    m.append(
        "a{su}",
        &[Value::Array {
            element: "{su}".into(),
            values: vec![],
        }],
    )
    .unwrap();
    m.rewind();
    let got = m.read("a{su}").unwrap().value().unwrap();
    assert_eq!(got[0].as_array().unwrap().len(), 0);
}

#[test]
fn test_container_discipline_violations() {
    let mut m = compose();
    assert!(matches!(m.close_container(), Err(Error::NoContainer)));
    assert!(matches!(m.exit_container(), Err(Error::NoContainer)));

    // closing a struct with missing fields
    let mut m = compose();
    m.open_container(ContainerKind::Struct, "su").unwrap();
    m.append("s", &[Value::Str("x".into())]).unwrap();
    assert!(matches!(
        m.close_container(),
        Err(Error::IncompleteContainer)
    ));
    m.append("u", &[Value::Uint32(1)]).unwrap();
    m.close_container().unwrap();

    // a variant holds exactly one value
    let mut m = compose();
    m.open_container(ContainerKind::Variant, "u").unwrap();
    m.append("u", &[Value::Uint32(1)]).unwrap();
    assert!(matches!(
        m.append("u", &[Value::Uint32(2)]),
        Err(Error::ContainerFull)
    ));
    m.close_container().unwrap();

    // array elements must match the declared element type
    let mut m = compose();
    m.open_container(ContainerKind::Array, "u").unwrap();
    assert!(matches!(
        m.append("s", &[Value::Str("no".into())]),
        Err(Error::TypeMismatch { .. })
    ));

    // dict entries only live inside arrays
    let mut m = compose();
    assert!(m.open_container(ContainerKind::DictEntry, "su").is_err());
}

#[test]
fn test_exit_before_consuming_fails() {
    let mut m = compose();
    m.open_container(ContainerKind::Array, "u").unwrap();
    m.append("u", &[Value::Uint32(1)]).unwrap();
    m.append("u", &[Value::Uint32(2)]).unwrap();
    m.close_container().unwrap();

    m.rewind();
    m.enter_container(ContainerKind::Array, "u").unwrap();
    assert_eq!(m.read_u32().unwrap(), ReadResult::Value(1));
    assert!(matches!(
        m.exit_container(),
        Err(Error::ContainerNotConsumed)
    ));
    assert_eq!(m.read_u32().unwrap(), ReadResult::Value(2));
    assert!(m.read_u32().unwrap().is_end());
    m.exit_container().unwrap();
}

#[test]
fn test_reading_past_struct_fields_is_an_error() {
    let mut m = compose();
    m.append(
        "(uu)",
        &[Value::Struct(vec![Value::Uint32(1), Value::Uint32(2)])],
    )
    .unwrap();
    m.rewind();
    m.enter_container(ContainerKind::Struct, "uu").unwrap();
    assert_eq!(m.read_u32().unwrap(), ReadResult::Value(1));
    assert_eq!(m.read_u32().unwrap(), ReadResult::Value(2));
    assert!(matches!(m.read_u32(), Err(Error::ReadPastEnd)));
    m.exit_container().unwrap();
}

#[test]
fn test_type_mismatch_retains_errno() {
    let mut m = compose();
    let err = m.append("u", &[Value::Str("oops".into())]).unwrap_err();
    assert!(matches!(err, Error::TypeMismatch { .. }));
    assert_eq!(m.last_errno(), libc::ENXIO);
}

#[test]
fn test_signature_validation_is_lazy() {
    let mut m = compose();
    let err = m
        .append("uz", &[Value::Uint32(9), Value::Uint32(10)])
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Signature(minibus_parser::Error::UnknownTypeCode('z'))
    ));
    // the value in front of the offending code stays appended
    assert_eq!(m.signature(), "u");
    assert_eq!(&m.body[..], &[9, 0, 0, 0]);
    assert_eq!(m.last_errno(), libc::EINVAL);
}

#[test]
fn test_read_signature_mismatch() {
    let mut m = compose();
    m.append("u", &[Value::Uint32(1)]).unwrap();
    m.rewind();
    assert!(matches!(m.read_str(), Err(Error::TypeMismatch { .. })));
    // the slot was not consumed by the failed read
    assert_eq!(m.read_u32().unwrap(), ReadResult::Value(1));
}

#[test]
fn test_strict_boolean_decode() {
    let mut m = Message::from_wire(
        MessageKind::MethodReturn,
        1,
        1,
        None,
        None,
        None,
        None,
        None,
        "b".into(),
        bytes::BytesMut::from(&[2u8, 0, 0, 0][..]),
    )
    .unwrap();
    assert!(matches!(m.read_bool(), Err(Error::BadMessage(_))));
    assert_eq!(m.last_errno(), libc::EBADMSG);
}

#[test]
fn test_nonzero_padding_rejected() {
    let mut m = Message::from_wire(
        MessageKind::MethodReturn,
        1,
        1,
        None,
        None,
        None,
        None,
        None,
        "yu".into(),
        bytes::BytesMut::from(&[1u8, 9, 9, 9, 42, 0, 0, 0][..]),
    )
    .unwrap();
    assert_eq!(m.read_byte().unwrap(), ReadResult::Value(1));
    assert!(matches!(m.read_u32(), Err(Error::BadMessage(_))));
}

#[test]
fn test_truncated_body_rejected() {
    let mut m = Message::from_wire(
        MessageKind::MethodReturn,
        1,
        1,
        None,
        None,
        None,
        None,
        None,
        "u".into(),
        bytes::BytesMut::from(&[1u8, 0][..]),
    )
    .unwrap();
    assert!(matches!(m.read_u32(), Err(Error::BadMessage(_))));
}

#[test]
fn test_peek_type() {
    let mut m = compose();
    m.append(
        "ua(uu)",
        &[
            Value::Uint32(1),
            Value::Array {
                element: "(uu)".into(),
                values: vec![],
            },
        ],
    )
    .unwrap();
    m.rewind();
    assert_eq!(m.peek_type().unwrap(), Some(('u', None)));
    m.read_u32().unwrap();
    assert_eq!(m.peek_type().unwrap(), Some(('a', Some("(uu)"))));
    m.read("a(uu)").unwrap();
    assert_eq!(m.peek_type().unwrap(), None);
}

#[test]
fn test_method_call_validation() {
    let conn = Connection::with_transport(Box::new(LoopbackBus::new("org.example.None")));
    let mut conn = conn.write().unwrap();
    assert!(conn
        .new_method_call("", "/", "org.example.X", "Get")
        .is_err());
    assert!(conn
        .new_method_call("org.example.X", "no-slash", "org.example.X", "Get")
        .is_err());
    assert!(conn
        .new_method_call("org.example.X", "/p//q", "org.example.X", "Get")
        .is_err());
    assert!(conn
        .new_method_call("org.example.X", "/", "org.example.X", "")
        .is_err());
    assert!(conn
        .new_method_call("org.example.X", "/", "org.example.X", "Get\0x")
        .is_err());
    assert_eq!(conn.last_errno(), libc::EINVAL);
    assert!(conn
        .new_method_call("org.example.X", "/", "org.example.X", "Get")
        .is_ok());
}

#[test]
fn test_object_path_rules() {
    assert!(is_valid_object_path("/"));
    assert!(is_valid_object_path("/org/freedesktop/systemd1"));
    assert!(is_valid_object_path("/a_b/c0"));
    assert!(!is_valid_object_path(""));
    assert!(!is_valid_object_path("relative"));
    assert!(!is_valid_object_path("/trailing/"));
    assert!(!is_valid_object_path("//double"));
    assert!(!is_valid_object_path("/bad-char"));
}

fn unit_record(name: &str, active: &str, path: &str, job: u32) -> Vec<Value> {
    vec![
        Value::Str(name.into()),
        Value::Str(format!("{} unit", name)),
        Value::Str("loaded".into()),
        Value::Str(active.into()),
        Value::Str("running".into()),
        Value::Str(String::new()),
        Value::ObjectPath(path.into()),
        Value::Uint32(job),
        Value::Str(String::new()),
        Value::ObjectPath("/".into()),
    ]
}

fn list_units_bus() -> LoopbackBus {
    let mut bus = LoopbackBus::new("org.freedesktop.systemd1");
    bus.register("org.freedesktop.systemd1.Manager", "ListUnits", |call| {
        let mut reply = Message::new_method_return(call).unwrap();
        reply
            .open_container(ContainerKind::Array, "(ssssssouso)")
            .unwrap();
        for (name, path) in [
            ("dbus.service", "/org/freedesktop/systemd1/unit/dbus"),
            ("ssh.service", "/org/freedesktop/systemd1/unit/ssh"),
        ] {
            reply
                .append(
                    "(ssssssouso)",
                    &[Value::Struct(unit_record(name, "active", path, 0))],
                )
                .unwrap();
        }
        reply.close_container().unwrap();
        Ok(reply)
    });
    bus
}

#[test]
fn test_list_units_scenario() {
    let conn = Connection::with_transport(Box::new(list_units_bus()));
    let mut conn = conn.write().unwrap();

    let call = conn
        .new_method_call(
            "org.freedesktop.systemd1",
            "/org/freedesktop/systemd1",
            "org.freedesktop.systemd1.Manager",
            "ListUnits",
        )
        .unwrap();
    let mut reply = conn.call(call, None).unwrap();
    assert_eq!(reply.kind(), MessageKind::MethodReturn);
    assert_eq!(reply.signature(), "a(ssssssouso)");

    reply
        .enter_container(ContainerKind::Array, "(ssssssouso)")
        .unwrap();
    let mut names = Vec::new();
    loop {
        match reply.read("(ssssssouso)").unwrap() {
            ReadResult::End => break,
            ReadResult::Value(values) => {
                let fields = values[0].as_struct().unwrap();
                assert_eq!(fields.len(), 10);
                names.push(fields[0].as_str().unwrap().to_string());
                assert_eq!(fields[3].as_str().unwrap(), "active");
            }
        }
    }
    reply.exit_container().unwrap();
    assert_eq!(names, ["dbus.service", "ssh.service"]);

    assert!(conn.last_remote_error().is_none());
    reply.release();
    conn.close();
    conn.close();
}

#[test]
fn test_remote_error_retention_and_copy() {
    let mut bus = LoopbackBus::new("org.example.Svc");
    bus.register("org.example.Svc", "Deny", |_call| {
        Err(RemoteError::new("org.example.Error.Denied", "not today"))
    });
    bus.register("org.example.Svc", "Allow", |call| {
        Ok(Message::new_method_return(call).unwrap())
    });
    let conn = Connection::with_transport(Box::new(bus));
    let mut conn = conn.write().unwrap();

    let call = conn
        .new_method_call("org.example.Svc", "/", "org.example.Svc", "Deny")
        .unwrap();
    let err = conn.call(call, None).unwrap_err();
    assert!(matches!(err, Error::Remote(_)));

    let borrowed = conn.last_remote_error().unwrap();
    assert_eq!(borrowed.name(), Some("org.example.Error.Denied"));
    assert_eq!(borrowed.message(), Some("not today"));
    let copied = borrowed.to_owned();

    // the next call clears the retained error; the copy survives
    let call = conn
        .new_method_call("org.example.Svc", "/", "org.example.Svc", "Allow")
        .unwrap();
    conn.call(call, None).unwrap();
    assert!(conn.last_remote_error().is_none());
    assert_eq!(copied.name(), Some("org.example.Error.Denied"));

    // copying with nothing retained yields the all-None default
    let unset = conn.copy_remote_error();
    assert!(!unset.is_set());
    assert_eq!(unset.name(), None);
    assert_eq!(unset.message(), None);
}

#[test]
fn test_call_without_listening_service() {
    let conn = Connection::with_transport(Box::new(LoopbackBus::new("org.example.Present")));
    let mut conn = conn.write().unwrap();

    let call = conn
        .new_method_call("org.example.Absent", "/", "org.example.Absent", "Ping")
        .unwrap();
    let err = conn.call(call, None).unwrap_err();
    match &err {
        Error::Remote(remote) => {
            assert_eq!(remote.name(), Some(ERROR_SERVICE_UNKNOWN));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(conn.last_errno(), libc::ENXIO);

    // the connection stays usable
    let call = conn
        .new_method_call("org.example.Present", "/", "org.example.Present", "Ping")
        .unwrap();
    let err = conn.call(call, None).unwrap_err();
    match &err {
        Error::Remote(remote) => {
            assert_eq!(remote.name(), Some(ERROR_UNKNOWN_METHOD));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn test_call_with_open_container_rejected() {
    let conn = Connection::with_transport(Box::new(LoopbackBus::new("org.example.Svc")));
    let mut conn = conn.write().unwrap();
    let mut call = conn
        .new_method_call("org.example.Svc", "/", "org.example.Svc", "Ping")
        .unwrap();
    call.open_container(ContainerKind::Array, "u").unwrap();
    assert!(matches!(
        conn.call(call, None),
        Err(Error::UnclosedContainer)
    ));
}

#[test]
fn test_call_on_closed_connection() {
    let conn = Connection::with_transport(Box::new(LoopbackBus::new("org.example.Svc")));
    let mut conn = conn.write().unwrap();
    let call = conn
        .new_method_call("org.example.Svc", "/", "org.example.Svc", "Ping")
        .unwrap();
    conn.close();
    assert!(matches!(
        conn.call(call, None),
        Err(Error::ConnectionClosed)
    ));
}

#[test]
fn test_default_bus_is_cached_per_thread() {
    let opened = Arc::new(AtomicUsize::new(0));

    let make = |opened: Arc<AtomicUsize>| {
        move || {
            opened.fetch_add(1, Ordering::SeqCst);
            Ok(Connection::with_transport(Box::new(LoopbackBus::new(
                "org.example.Default",
            ))))
        }
    };

    let a = default_bus_cached(make(opened.clone())).unwrap();
    let b = default_bus_cached(make(opened.clone())).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(opened.load(Ordering::SeqCst), 1);

    // once all references are gone a fresh connection is opened
    drop(a);
    drop(b);
    let c = default_bus_cached(make(opened.clone())).unwrap();
    assert_eq!(opened.load(Ordering::SeqCst), 2);
    drop(c);
}

#[test]
fn test_bus_address_parsing() {
    assert_eq!(
        BusAddress::parse("unix:path=/run/user/1000/bus").unwrap(),
        BusAddress::Path("/run/user/1000/bus".into())
    );
    assert_eq!(
        BusAddress::parse("unix:abstract=/tmp/dbus-abc,guid=1234").unwrap(),
        BusAddress::Abstract("/tmp/dbus-abc".into())
    );
    // unsupported entries are skipped
    assert_eq!(
        BusAddress::parse("tcp:host=localhost,port=1;unix:path=/x").unwrap(),
        BusAddress::Path("/x".into())
    );
    assert!(matches!(
        BusAddress::parse("nonsense"),
        Err(Error::InvalidAddress(_))
    ));
    assert_eq!(
        BusAddress::Path("/x".into()).to_string(),
        "unix:path=/x"
    );
}

#[test]
fn test_connect_failure_retains_errno() {
    let missing = BusAddress::Path("/nonexistent/minibus/socket".into());
    let err = StreamTransport::connect(&missing).unwrap_err();
    match &err {
        Error::ConnectionFailed { address, .. } => {
            assert_eq!(address, "unix:path=/nonexistent/minibus/socket");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_ne!(err.errno(), 0);
}

#[test]
fn test_stream_transport_end_to_end() {
    use std::os::unix::net::UnixListener;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bus");
    let listener = UnixListener::bind(&path).unwrap();

    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        // answer an unrelated serial first; the client must skip it
        let call = client::read_envelope(&mut stream).unwrap();
        let mut bogus = Message::new_method_return(&call).unwrap();
        bogus.reply_serial = call.serial().wrapping_add(7);
        client::write_envelope(&mut stream, &bogus).unwrap();

        let mut reply = Message::new_method_return(&call).unwrap();
        reply
            .append("s", &[Value::Str("pong".into())])
            .unwrap();
        client::write_envelope(&mut stream, &reply).unwrap();
    });

    let address = BusAddress::Path(path.to_str().unwrap().to_string());
    let conn = Connection::with_transport(Box::new(StreamTransport::connect(&address).unwrap()));
    let mut conn = conn.write().unwrap();
    let mut call = conn
        .new_method_call("org.example.Echo", "/", "org.example.Echo", "Ping")
        .unwrap();
    call.append("s", &[Value::Str("ping".into())]).unwrap();
    let mut reply = conn.call(call, Some(Duration::from_secs(5))).unwrap();
    assert_eq!(reply.read_str().unwrap(), ReadResult::Value("pong"));

    server.join().unwrap();
}

#[test]
fn test_stream_transport_timeout() {
    use std::os::unix::net::UnixListener;
    use std::sync::mpsc;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bus");
    let listener = UnixListener::bind(&path).unwrap();
    let (tx, rx) = mpsc::channel::<()>();

    let server = std::thread::spawn(move || {
        let (_stream, _) = listener.accept().unwrap();
        // hold the socket open without answering until the client timed out
        let _ = rx.recv();
    });

    let address = BusAddress::Path(path.to_str().unwrap().to_string());
    let conn = Connection::with_transport(Box::new(StreamTransport::connect(&address).unwrap()));
    let mut conn = conn.write().unwrap();
    let call = conn
        .new_method_call("org.example.Slow", "/", "org.example.Slow", "Wait")
        .unwrap();
    let err = conn
        .call(call, Some(Duration::from_millis(100)))
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));
    assert_eq!(conn.last_errno(), libc::ETIMEDOUT);
    assert!(conn.last_remote_error().is_none());

    tx.send(()).unwrap();
    server.join().unwrap();
}

#[test]
fn test_new_error_reply_shape() {
    let call = compose();
    let mut err = Message::new_error(&call, "org.example.Error.Boom", "it broke").unwrap();
    assert_eq!(err.kind(), MessageKind::Error);
    assert_eq!(err.error_name(), Some("org.example.Error.Boom"));
    assert_eq!(err.signature(), "s");
    err.rewind();
    assert_eq!(err.read_str().unwrap(), ReadResult::Value("it broke"));

    let reply = Message::new_method_return(&call).unwrap();
    assert!(Message::new_method_return(&reply).is_err());
}
