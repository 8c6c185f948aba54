use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, bail};
use futures::StreamExt;
use isobridge::{
    ContextConfig, SerializationContext, StreamConfig, Tagged, Value, WireValue,
    value::{Array, AsyncIterable, Function, MapObject, Object, Promise, SetObject},
};

use crate::common::{linked, settle};

#[test]
fn scalars_and_dates_have_plain_shapes() -> Result<()> {
    let ctx = SerializationContext::default();
    assert_eq!(ctx.serialize(&Value::from(42)), WireValue::Number(42.0));

    let wire = ctx.serialize(&Value::Date(0.0));
    assert!(matches!(
        wire.as_tagged(),
        Some(Tagged::Date { epoch_ms }) if *epoch_ms == 0.0
    ));
    assert_eq!(ctx.deserialize(&wire), Value::Date(0.0));
    Ok(())
}

#[test]
fn structured_values_round_trip() -> Result<()> {
    let ctx = SerializationContext::default();
    let map = MapObject::new();
    map.set("k", 1);
    map.set(2, "two");
    let set = SetObject::new();
    set.add("a");
    set.add(Value::Null);
    let object = Object::from_entries([
        ("list", Value::from(vec![Value::from(1), Value::from("x")])),
        ("map", Value::Map(map)),
        ("set", Value::Set(set)),
        ("big", Value::BigInt(1 << 70)),
        ("url", Value::Url(url::Url::parse("https://example.com/a?b=c")?)),
        ("error", Value::error("RangeError", "out of range")),
        ("nothing", Value::Undefined),
    ]);
    let value = Value::Object(object);
    let back = ctx.deserialize(&ctx.serialize(&value));
    assert!(back.deep_eq(&value), "{back:?}");

    // Through a real frame as well.
    let frame = isobridge_cbor::encode_frame(&ctx.serialize(&value))?;
    let wire: WireValue = isobridge_cbor::decode_frame(&frame)?;
    assert!(ctx.deserialize(&wire).deep_eq(&value));
    Ok(())
}

#[test]
fn unknown_tags_fall_back_to_plain_objects() -> Result<()> {
    let ctx = SerializationContext::default();
    let frame = isobridge_cbor::encode_frame(&serde_json::json!({ "$t": "bogus", "x": 1 }))?;
    let wire: WireValue = isobridge_cbor::decode_frame(&frame)?;

    let Value::Object(object) = ctx.deserialize(&wire) else {
        bail!("expected a plain object");
    };
    assert_eq!(object.class_name(), None);
    assert_eq!(object.get("x"), Value::from(1));
    assert_eq!(object.get("$t"), Value::from("bogus"));
    Ok(())
}

#[test]
fn throwing_getter_on_class_instance_is_omitted() -> Result<()> {
    let ctx = SerializationContext::default();
    let point = Object::with_class("Point");
    point.set("x", 1);
    point.define_getter("broken", |_| Err(Value::type_error("no")));

    let wire = ctx.serialize(&Value::Object(point));
    let Some(Tagged::Custom {
        ctor_name, props, ..
    }) = wire.as_tagged()
    else {
        bail!("expected a custom object, got {wire:?}");
    };
    assert_eq!(ctor_name, "Point");
    assert_eq!(props.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(), ["x"]);

    let Value::Object(decoded) = ctx.deserialize(&wire) else {
        bail!("expected an object");
    };
    assert_eq!(decoded.class_name(), Some("Point"));
    assert_eq!(decoded.keys(), ["x"]);
    Ok(())
}

#[test]
fn cycles_survive() -> Result<()> {
    let ctx = SerializationContext::default();
    let parent = Object::new();
    let children = Array::new();
    let child = Object::new();
    child.set("parent", parent.clone());
    children.push(child);
    parent.set("children", children);
    parent.set("self", parent.clone());

    let Value::Object(back) = ctx.deserialize(&ctx.serialize(&Value::Object(parent))) else {
        bail!("expected an object");
    };
    let Value::Object(again) = back.get("self") else {
        bail!("expected self reference");
    };
    assert!(again.ptr_eq(&back));
    let Value::Array(children) = back.get("children") else {
        bail!("expected children");
    };
    let Value::Object(child) = children.get(0) else {
        bail!("expected child");
    };
    assert!(matches!(child.get("parent"), Value::Object(p) if p.ptr_eq(&back)));
    Ok(())
}

#[tokio::test]
async fn stable_handles_and_single_call_envelope() -> Result<()> {
    let (a, b, sent) = linked(
        SerializationContext::default(),
        SerializationContext::default(),
    );
    let receiver = Object::new();
    let double = Function::from_sync("double", |_, args| {
        Ok(Value::Number(args.first().and_then(Value::as_f64).unwrap_or(0.0) * 2.0))
    });
    receiver.set("double", double.clone());

    let first = a.serialize(&Value::Object(receiver.clone()));
    let second = a.serialize(&Value::Object(receiver.clone()));
    let handle_of = |wire: &WireValue| -> Option<String> {
        let Some(Tagged::Object { props, .. }) = wire.as_tagged() else {
            return None;
        };
        let (_, double) = props.iter().find(|(key, _)| key == "double")?;
        match double.as_tagged()? {
            Tagged::Function { handle, .. } => Some(handle.clone()),
            _ => None,
        }
    };
    assert!(handle_of(&first).is_some());
    assert_eq!(handle_of(&first), handle_of(&second));

    let Value::Object(proxy) = b.deserialize(&first) else {
        bail!("expected an object");
    };
    let Value::Function(remote) = proxy.get("double") else {
        bail!("expected a function");
    };
    let result = remote.call(Value::Undefined, vec![Value::from(21)]).await;
    assert_eq!(result, Ok(Value::Number(42.0)));
    // One call and one return.
    assert_eq!(sent.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn settled_promise_needs_no_messages() -> Result<()> {
    let (a, b, sent) = linked(
        SerializationContext::default(),
        SerializationContext::default(),
    );
    let Value::Promise(remote) = b.deserialize(&a.serialize(&Value::from(Promise::resolved(5))))
    else {
        bail!("expected a promise");
    };
    assert_eq!(remote.peek(), Some(Ok(Value::Number(5.0))));
    assert_eq!(remote.settled().await, Ok(Value::Number(5.0)));
    settle().await;
    assert_eq!(sent.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn pending_promise_settles_remotely() -> Result<()> {
    let (a, b, _) = linked(
        SerializationContext::default(),
        SerializationContext::default(),
    );
    let (promise, resolver) = Promise::pending();
    let Value::Promise(remote) = b.deserialize(&a.serialize(&Value::from(promise))) else {
        bail!("expected a promise");
    };
    assert!(!remote.is_settled());
    resolver.reject(Value::type_error("nope"));
    assert_eq!(remote.settled().await, Err(Value::type_error("nope")));
    Ok(())
}

fn slow_config() -> ContextConfig {
    ContextConfig {
        stream: StreamConfig::default()
            .grace(Duration::from_millis(180))
            .max_buffered(16),
        ..ContextConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn slow_consumer_receives_everything_in_order() -> Result<()> {
    let (a, b, _) = linked(SerializationContext::new(slow_config()), SerializationContext::default());
    let items: Vec<Value> = (0..40).map(Value::from).collect();
    let source = AsyncIterable::from_values(items.clone());
    let Value::AsyncIterable(remote) = b.deserialize(&a.serialize(&Value::AsyncIterable(source)))
    else {
        bail!("expected an async iterable");
    };

    let mut stream = remote.take().ok_or_else(|| anyhow::anyhow!("consumed"))?;
    let mut received = Vec::new();
    while let Some(item) = stream.next().await {
        received.push(item.map_err(|e| anyhow::anyhow!(e.describe()))?);
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    assert_eq!(received, items);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn errors_are_raised_after_buffered_items() -> Result<()> {
    let (a, b, _) = linked(SerializationContext::default(), SerializationContext::default());
    let source = AsyncIterable::from_stream(futures::stream::iter([
        Ok(Value::from(1)),
        Ok(Value::from(2)),
        Err(Value::type_error("broken")),
    ]));
    let Value::AsyncIterable(remote) = b.deserialize(&a.serialize(&Value::AsyncIterable(source)))
    else {
        bail!("expected an async iterable");
    };
    let mut stream = remote.take().ok_or_else(|| anyhow::anyhow!("consumed"))?;
    assert_eq!(stream.next().await, Some(Ok(Value::from(1))));
    assert_eq!(stream.next().await, Some(Ok(Value::from(2))));
    assert_eq!(stream.next().await, Some(Err(Value::type_error("broken"))));
    assert_eq!(stream.next().await, None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn dropping_consumer_stops_production() -> Result<()> {
    let (a, b, _) = linked(SerializationContext::new(slow_config()), SerializationContext::default());
    let produced = Arc::new(AtomicUsize::new(0));
    let counter = produced.clone();
    let source = AsyncIterable::from_stream(futures::stream::iter(0..).map(move |i: i32| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Value::from(i))
    }));
    let Value::AsyncIterable(remote) = b.deserialize(&a.serialize(&Value::AsyncIterable(source)))
    else {
        bail!("expected an async iterable");
    };

    let mut stream = remote.take().ok_or_else(|| anyhow::anyhow!("consumed"))?;
    assert_eq!(stream.next().await, Some(Ok(Value::from(0))));
    drop(stream);
    settle().await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let after_cancel = produced.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(produced.load(Ordering::SeqCst), after_cancel);
    assert!(after_cancel < 64, "produced {after_cancel}");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn dropped_sequences_release_exporter_handles() -> Result<()> {
    let (a, b, _) = linked(SerializationContext::new(slow_config()), SerializationContext::default());

    for _ in 0..10 {
        let source = AsyncIterable::from_stream(
            futures::stream::iter(0..).map(|i: i32| Ok(Value::from(i))),
        );
        let Value::AsyncIterable(remote) =
            b.deserialize(&a.serialize(&Value::AsyncIterable(source)))
        else {
            bail!("expected an async iterable");
        };
        let mut stream = remote.take().ok_or_else(|| anyhow::anyhow!("consumed"))?;
        assert_eq!(stream.next().await, Some(Ok(Value::from(0))));
    }
    for _ in 0..10 {
        let source = AsyncIterable::from_values(vec![Value::Null]);
        drop(b.deserialize(&a.serialize(&Value::AsyncIterable(source))));
    }
    settle().await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(a.context().functions().is_empty(), "{} live handles", a.context().functions().len());
    Ok(())
}

#[tokio::test]
async fn foreign_handles_are_rejected() -> Result<()> {
    let ctx = SerializationContext::default();
    let err = ctx.invoke("elsewhere:f#1", Vec::new()).await;
    assert!(matches!(err, Err(Value::Error(e)) if e.name == "ReferenceError"));
    Ok(())
}
