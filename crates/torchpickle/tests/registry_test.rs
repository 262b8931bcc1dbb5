mod common;

use std::collections::HashMap;

use common::PickleBuilder;
use torchpickle::{
    pickle::{DictKey, Payload, Value},
    unpickle, Instantiator, InstantiatorRegistry, UnpickleError,
};

#[test]
fn test_custom_encoding_handler() {
    InstantiatorRegistry::add(Instantiator::new(
        &["tiktoken.core.Encoding"],
        &["TiktokenEncoding"],
        |_| Value::object("TiktokenEncoding", Payload::Empty),
        |_object, arguments| {
            let args = arguments.as_tuple().ok_or_else(|| {
                UnpickleError::Malformed(
                    "encoding arguments must be a tuple".to_string(),
                )
            })?;
            if args.len() != 4 {
                return Err(UnpickleError::Malformed(format!(
                    "encoding takes 4 arguments, got {}",
                    args.len()
                )));
            }
            let mut fields = HashMap::new();
            fields.insert(
                DictKey::String("name".to_string()),
                args[0].clone(),
            );
            fields.insert(
                DictKey::String("mergeable_ranks".to_string()),
                args[1].clone(),
            );
            fields.insert(
                DictKey::String("special_tokens".to_string()),
                args[2].clone(),
            );
            fields.insert(
                DictKey::String("pat_str".to_string()),
                args[3].clone(),
            );
            Ok(Value::object(
                "TiktokenEncoding",
                Payload::Value(Value::dict(fields)),
            ))
        },
    ));

    const RANK_COUNT: i64 = 65527;
    let special = [
        "<|bos|>",
        "<|user_start|>",
        "<|user_end|>",
        "<|assistant_start|>",
        "<|assistant_end|>",
        "<|python_start|>",
        "<|python_end|>",
        "<|output_start|>",
        "<|output_end|>",
    ];

    let mut b = PickleBuilder::new(2)
        .global("tiktoken.core", "Encoding")
        .mark()
        .string("rustbpe")
        .empty_dict()
        .mark();
    for rank in 0..RANK_COUNT {
        b = b.bytes(format!("tok{rank}").as_bytes()).int(rank);
    }
    b = b.setitems().empty_dict().mark();
    for (rank, token) in special.iter().enumerate() {
        b = b.string(token).int(RANK_COUNT + rank as i64);
    }
    let stream = b
        .setitems()
        .string("'(?i:[sdmt]|ll|ve|re)|\\s+'")
        .tuple()
        .reduce()
        .stop()
        .finish();

    let value = unpickle(&stream).unwrap();
    let object = value.as_object().unwrap().borrow();
    assert_eq!(object.tag(), "TiktokenEncoding");

    let state = object.state().unwrap();
    assert_eq!(state.get("name").unwrap().as_str(), Some("rustbpe"));
    let ranks = state.get("mergeable_ranks").unwrap();
    assert_eq!(ranks.as_dict().unwrap().borrow().len(), RANK_COUNT as usize);
    let special_tokens = state.get("special_tokens").unwrap();
    assert_eq!(special_tokens.as_dict().unwrap().borrow().len(), 9);
}

#[test]
fn test_registration_overwrites() {
    InstantiatorRegistry::add(Instantiator::new(
        &["overwrite.Me"],
        &["OverwriteMe"],
        |_| Value::object("OverwriteMe", Payload::Value(Value::Int(1))),
        |object, _| Ok(object),
    ));
    InstantiatorRegistry::add(Instantiator::new(
        &["overwrite.Me"],
        &["OverwriteMe"],
        |_| Value::object("OverwriteMe", Payload::Value(Value::Int(2))),
        |object, _| Ok(object),
    ));

    let value = InstantiatorRegistry::create("overwrite", "Me").unwrap();
    let object = value.as_object().unwrap().borrow();
    assert_eq!(object.state(), Some(&Value::Int(2)));
}

#[test]
fn test_build_merges_state_without_a_registered_initializer() {
    InstantiatorRegistry::add(Instantiator::new(
        &["mymod.Thing"],
        &[],
        |_| {
            Value::object(
                "Thing",
                Payload::Value(Value::dict(HashMap::new())),
            )
        },
        |object, _| Ok(object),
    ));

    let stream = PickleBuilder::new(2)
        .global("mymod", "Thing")
        .empty_dict()
        .mark()
        .string("weight")
        .int(42)
        .setitems()
        .build()
        .stop()
        .finish();

    let value = unpickle(&stream).unwrap();
    let object = value.as_object().unwrap().borrow();
    assert_eq!(object.tag(), "Thing");
    let state = object.state().unwrap();
    assert_eq!(state.get("weight").unwrap().as_int(), Some(42));
}

#[test]
fn test_build_routes_through_registered_dict_initializer() {
    let stream = PickleBuilder::new(2)
        .global("collections", "OrderedDict")
        .empty_tuple()
        .reduce()
        .empty_dict()
        .mark()
        .string("a")
        .int(1)
        .setitems()
        .build()
        .stop()
        .finish();

    let value = unpickle(&stream).unwrap();
    let object = value.as_object().unwrap().borrow();
    assert_eq!(object.tag(), "Dict");
    let state = object.state().unwrap();
    assert_eq!(state.get("a").unwrap().as_int(), Some(1));
}

#[test]
fn test_build_on_plain_value_without_dict_state_fails() {
    let stream = PickleBuilder::new(2)
        .int(1)
        .int(2)
        .build()
        .stop()
        .finish();
    assert!(matches!(
        unpickle(&stream),
        Err(UnpickleError::Malformed(_))
    ));
}

#[test]
fn test_ordered_dict_reduce_with_pair_list() {
    let stream = PickleBuilder::new(2)
        .global("collections", "OrderedDict")
        .mark()
        .empty_list()
        .mark()
        .string("k")
        .int(7)
        .tuple2()
        .appends()
        .tuple()
        .reduce()
        .stop()
        .finish();

    let value = unpickle(&stream).unwrap();
    let object = value.as_object().unwrap().borrow();
    assert_eq!(object.tag(), "Dict");
    assert_eq!(
        object.state().unwrap().get("k").unwrap().as_int(),
        Some(7)
    );
}
