use domain::{DataType, Value, shutdown_channel};

#[test]
fn sanitize_replaces_non_finite_and_flags_adjustment() {
    assert_eq!(Value::Float(f64::NAN).sanitize(), (Value::Float(0.0), true));
    assert_eq!(
        Value::Float(f64::NEG_INFINITY).sanitize(),
        (Value::Float(0.0), true)
    );
    assert_eq!(Value::Float(12.5).sanitize(), (Value::Float(12.5), false));
}

#[test]
fn sanitize_maps_bool_to_integer() {
    assert_eq!(Value::Bool(true).sanitize(), (Value::Int(1), false));
    assert_eq!(Value::Bool(false).sanitize(), (Value::Int(0), false));
}

#[test]
fn coerce_follows_data_type() {
    assert_eq!(DataType::Int.coerce(Value::Float(3.9)), Value::Int(3));
    assert_eq!(DataType::Int.coerce(Value::Float(-3.9)), Value::Int(-3));
    assert_eq!(DataType::Float.coerce(Value::Int(7)), Value::Float(7.0));
    assert_eq!(DataType::Bool.coerce(Value::Float(0.2)), Value::Int(1));
    assert_eq!(DataType::Bool.coerce(Value::Int(0)), Value::Int(0));
}

#[test]
fn infer_uses_default_variant() {
    assert_eq!(DataType::infer(&Value::Int(0)), DataType::Int);
    assert_eq!(DataType::infer(&Value::Float(0.0)), DataType::Float);
    assert_eq!(DataType::infer(&Value::Bool(false)), DataType::Bool);
}

#[test]
fn value_json_is_untagged() {
    let parsed: Value = serde_json::from_str("28.7").expect("float");
    assert_eq!(parsed, Value::Float(28.7));
    let parsed: Value = serde_json::from_str("3").expect("int");
    assert_eq!(parsed, Value::Int(3));
    let parsed: Value = serde_json::from_str("true").expect("bool");
    assert_eq!(parsed, Value::Bool(true));
    assert_eq!(serde_json::to_string(&Value::Float(1.5)).expect("ser"), "1.5");
}

#[tokio::test]
async fn shutdown_wakes_all_listeners() {
    let (trigger, shutdown) = shutdown_channel();
    let other = trigger.subscribe();
    assert!(!shutdown.is_triggered());

    let waiter = tokio::spawn(async move { other.wait().await });
    trigger.trigger();
    waiter.await.expect("join");
    assert!(shutdown.is_triggered());
}

#[tokio::test]
async fn dropped_trigger_counts_as_shutdown() {
    let (trigger, shutdown) = shutdown_channel();
    drop(trigger);
    shutdown.wait().await;
}
