// Byte-exact wire vectors plus a generated round-trip property.
use bytes::Bytes;
use muscle_wire::{type_code, Field, FrameHeader, Message, MESSAGE_PROTOCOL_MAGIC};
use proptest::collection::vec;
use proptest::prelude::*;

#[test]
fn flatten_matches_reference_layout() {
    let sub = Message::new(7);
    let mut msg = Message::new(1234);
    msg.set_field("nums", Field::Int32(vec![1, -2, 3]));
    msg.set_field("name", Field::String(vec!["muscle".into()]));
    msg.set_field("sub", Field::Message(vec![sub.clone()]));

    // Build the expected stream by hand, word by word.
    let mut expected: Vec<u8> = Vec::new();
    expected.extend_from_slice(&MESSAGE_PROTOCOL_MAGIC.to_le_bytes());
    expected.extend_from_slice(&1234u32.to_le_bytes());
    expected.extend_from_slice(&3u32.to_le_bytes());

    expected.extend_from_slice(&5u32.to_le_bytes()); // "nums" + NUL
    expected.extend_from_slice(b"nums\0");
    expected.extend_from_slice(&type_code::INT32.to_le_bytes());
    expected.extend_from_slice(&12u32.to_le_bytes());
    expected.extend_from_slice(&1i32.to_le_bytes());
    expected.extend_from_slice(&(-2i32).to_le_bytes());
    expected.extend_from_slice(&3i32.to_le_bytes());

    expected.extend_from_slice(&5u32.to_le_bytes()); // "name" + NUL
    expected.extend_from_slice(b"name\0");
    expected.extend_from_slice(&type_code::STRING.to_le_bytes());
    expected.extend_from_slice(&11u32.to_le_bytes()); // count word + "muscle" + NUL
    expected.extend_from_slice(&1u32.to_le_bytes());
    expected.extend_from_slice(b"muscle\0");

    expected.extend_from_slice(&4u32.to_le_bytes()); // "sub" + NUL
    expected.extend_from_slice(b"sub\0");
    expected.extend_from_slice(&type_code::MESSAGE.to_le_bytes());
    expected.extend_from_slice(&20u32.to_le_bytes()); // count + item length + nested body
    expected.extend_from_slice(&1u32.to_le_bytes());
    expected.extend_from_slice(&12u32.to_le_bytes());
    expected.extend_from_slice(&MESSAGE_PROTOCOL_MAGIC.to_le_bytes());
    expected.extend_from_slice(&7u32.to_le_bytes());
    expected.extend_from_slice(&0u32.to_le_bytes());

    let flat = msg.flatten();
    assert_eq!(flat.as_ref(), expected.as_slice());
    assert_eq!(msg.flattened_size(), expected.len());

    let decoded = Message::unflatten(&flat).expect("decode");
    assert_eq!(decoded, msg);
    assert_eq!(decoded.first_message("sub").expect("sub"), &sub);
}

#[test]
fn framed_stream_decodes_back_to_back_messages() {
    let mut first = Message::new(1);
    first.set_field("a", Field::Bool(vec![true]));
    let mut second = Message::new(2);
    second.set_field("b", Field::UInt64(vec![u64::MAX]));

    let mut stream = muscle_wire::frame::encode_frame(&first).to_vec();
    stream.extend_from_slice(&muscle_wire::frame::encode_frame(&second));

    let header = FrameHeader::decode(&stream).expect("first header");
    let body_len = header.check_body_len(1 << 20).expect("cap");
    let body_end = FrameHeader::LEN + body_len;
    assert_eq!(
        Message::unflatten(&stream[FrameHeader::LEN..body_end]).expect("first"),
        first
    );
    let header = FrameHeader::decode(&stream[body_end..]).expect("second header");
    let start = body_end + FrameHeader::LEN;
    assert_eq!(
        Message::unflatten(&stream[start..start + header.body_len as usize]).expect("second"),
        second
    );
}

fn leaf_field() -> impl Strategy<Value = Field> {
    prop_oneof![
        vec(any::<bool>(), 0..5).prop_map(Field::Bool),
        vec(any::<i8>(), 0..5).prop_map(Field::Int8),
        vec(any::<u8>(), 0..5).prop_map(Field::UInt8),
        vec(any::<i16>(), 0..5).prop_map(Field::Int16),
        vec(any::<u16>(), 0..5).prop_map(Field::UInt16),
        vec(any::<i32>(), 0..5).prop_map(Field::Int32),
        vec(any::<u32>(), 0..5).prop_map(Field::UInt32),
        vec(any::<i64>(), 0..5).prop_map(Field::Int64),
        vec(any::<u64>(), 0..5).prop_map(Field::UInt64),
        // Floats come from integer seeds so equality survives the trip.
        vec(any::<i16>(), 0..5).prop_map(|v| Field::Float(v.into_iter().map(f32::from).collect())),
        vec(any::<i32>(), 0..5).prop_map(|v| Field::Double(v.into_iter().map(f64::from).collect())),
        vec("[a-zA-Z0-9/ ]{0,12}", 0..4).prop_map(Field::String),
        vec((any::<i16>(), any::<i16>()), 0..4).prop_map(|v| Field::Point(
            v.into_iter()
                .map(|(x, y)| muscle_wire::Point {
                    x: f32::from(x),
                    y: f32::from(y),
                })
                .collect()
        )),
        (1u32..0x4000_0000, vec(vec(any::<u8>(), 0..16), 0..4)).prop_map(|(code, items)| {
            Field::Blob {
                type_code: code,
                items: items.into_iter().map(Bytes::from).collect(),
            }
        }),
    ]
}

fn arb_message() -> impl Strategy<Value = Message> {
    let leaf = (
        any::<u32>(),
        proptest::collection::btree_map("[a-z]{1,8}", leaf_field(), 0..5),
    )
        .prop_map(|(what, fields)| {
            let mut msg = Message::new(what);
            for (name, field) in fields {
                msg.set_field(name, field);
            }
            msg
        });
    leaf.prop_recursive(3, 12, 3, |inner| {
        (
            any::<u32>(),
            proptest::collection::btree_map("[a-z]{1,8}", leaf_field(), 0..4),
            proptest::collection::vec(inner, 0..3),
        )
            .prop_map(|(what, fields, subs)| {
                let mut msg = Message::new(what);
                for (name, field) in fields {
                    msg.set_field(name, field);
                }
                if !subs.is_empty() {
                    msg.set_field("children", Field::Message(subs));
                }
                msg
            })
    })
}

proptest! {
    #[test]
    fn unflatten_inverts_flatten(msg in arb_message()) {
        let flat = msg.flatten();
        prop_assert_eq!(flat.len(), msg.flattened_size());
        let decoded = Message::unflatten(&flat).expect("decode");
        prop_assert_eq!(&decoded, &msg);
        prop_assert_eq!(decoded.checksum(), msg.checksum());
    }

    #[test]
    fn truncated_input_never_panics(msg in arb_message(), cut in 0usize..64) {
        let flat = msg.flatten();
        let cut = cut.min(flat.len().saturating_sub(1));
        let _ = Message::unflatten(&flat[..cut]);
    }
}
