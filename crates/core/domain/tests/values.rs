use domain::{ConvertedData, KeyValue, PollKind, RpcReply, RpcRequest};
use serde_json::json;

#[test]
fn converted_data_routes_by_kind() {
    let mut data = ConvertedData::new("meter-1", "default");
    assert!(data.is_empty());

    data.push(PollKind::Timeseries, KeyValue::new("totalUsed", 120));
    data.push(PollKind::Attributes, KeyValue::new("meterNo", 7));

    assert_eq!(data.telemetry, vec![KeyValue::new("totalUsed", 120)]);
    assert_eq!(data.entries(PollKind::Attributes).len(), 1);

    let value = serde_json::to_value(&data).expect("serialize");
    assert_eq!(value["deviceName"], "meter-1");
    assert_eq!(value["telemetry"][0]["key"], "totalUsed");
}

#[test]
fn rpc_request_parses_wire_shape() {
    let request: RpcRequest = serde_json::from_value(json!({
        "device": "meter-1",
        "data": {"id": 42, "method": "setValve", "params": {"open": true}}
    }))
    .expect("parse");

    assert_eq!(request.data.id, 42);
    assert_eq!(request.data.params["open"], true);
}

#[test]
fn rpc_reply_shapes() {
    let request = RpcRequest::new("meter-1", 7, "setValve", json!({"open": true}));

    let ok = RpcReply::success(&request, true);
    assert_eq!(ok.result, json!({"setValve": true}));
    assert!(!ok.is_error());

    let failed = RpcReply::error(&request, "device not found");
    assert_eq!(failed.result, json!({"error": "device not found"}));
    assert!(failed.is_error());
    assert_eq!(failed.id, 7);
}
