mod common;

use common::*;
use ng_devhub_core::{
    context::DeviceDriverContext,
    executor::{DriverExecutor, ExecutorState},
};
use ng_devhub_error::HubError;
use ng_devhub_models::{
    address::Address,
    attributes::AttributeMap,
    dao::DriverState,
    event::DriverEvent,
    message::{names, ControlEvent, Message, MessageBody, PlatformMessage, ProtocolMessage, ProtocolPayload},
};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::oneshot;

fn spawn(harness: &Harness, driver: &Arc<RecordingDriver>, backlog: usize) -> Arc<DriverExecutor> {
    let device = harness.add_hub_device(driver, "ZIGB", "01");
    let context = DeviceDriverContext::new(
        device,
        driver.definition_ref(),
        DriverState::default(),
        harness.services(),
    );
    DriverExecutor::spawn(driver.clone(), context, backlog)
}

fn platform_event(name: &str) -> DriverEvent {
    DriverEvent::Message(Message::Platform(PlatformMessage::broadcast(
        Address::device_service(),
        MessageBody::new(name),
    )))
}

#[tokio::test]
async fn events_are_handled_in_fire_order() {
    let harness = Harness::new();
    let driver = RecordingDriver::new(definition("ZBSwitch", 1, false));
    let executor = spawn(&harness, &driver, 64);
    executor.start().unwrap();

    let names: Vec<String> = (0..20).map(|i| format!("test:Event{i}")).collect();
    let mut last = None;
    for name in &names {
        last = Some(executor.fire(platform_event(name)).unwrap());
    }
    within(last.unwrap().wait()).await.unwrap();

    let seen: Vec<String> = driver
        .events()
        .into_iter()
        .filter_map(|e| match e {
            DriverEvent::Message(Message::Platform(m)) => Some(m.body.message_type),
            _ => None,
        })
        .collect();
    assert_eq!(seen, names);
    assert_eq!(driver.event_names()[0], "DriverStarted");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn order_holds_across_tasks_on_different_threads() {
    let harness = Harness::new();
    let driver = RecordingDriver::new(definition("ZBSwitch", 1, false));
    let executor = spawn(&harness, &driver, 64);
    executor.start().unwrap();

    // each task fires one event and hands the turn to the next one
    let names: Vec<String> = (0..32).map(|i| format!("test:Event{i}")).collect();
    let (first_turn, mut turn) = oneshot::channel::<()>();
    let mut tasks = Vec::new();
    for name in names.clone() {
        let (next_turn, next) = oneshot::channel::<()>();
        let executor = Arc::clone(&executor);
        tasks.push(tokio::spawn(async move {
            turn.await.unwrap();
            let handle = executor.fire(platform_event(&name)).unwrap();
            next_turn.send(()).unwrap();
            handle.wait().await
        }));
        turn = next;
    }
    first_turn.send(()).unwrap();
    for task in tasks {
        within(task).await.unwrap().unwrap();
    }
    within(turn).await.unwrap();

    let seen: Vec<String> = driver
        .events()
        .into_iter()
        .filter_map(|e| match e {
            DriverEvent::Message(Message::Platform(m)) => Some(m.body.message_type),
            _ => None,
        })
        .collect();
    assert_eq!(seen, names);
}

#[tokio::test]
async fn full_mailbox_rejects_without_blocking() {
    let harness = Harness::new();
    let driver = RecordingDriver::blocking(definition("ZBSwitch", 1, false));
    let executor = spawn(&harness, &driver, 2);
    executor.start().unwrap();
    // the worker is parked inside DriverStarted, the mailbox is empty
    eventually(|| driver.entered() == 1).await;

    let first = executor.fire(platform_event("test:A")).unwrap();
    let second = executor.fire(platform_event("test:B")).unwrap();
    let rejected = executor.fire(platform_event("test:C"));
    assert!(matches!(
        rejected,
        Err(HubError::QueueFull { capacity: 2, .. })
    ));
    assert_eq!(executor.queued_count(), 2);

    driver.unblock();
    within(first.wait()).await.unwrap();
    within(second.wait()).await.unwrap();
    assert_eq!(driver.count("Message"), 2);
}

#[tokio::test]
async fn stop_drains_queue_then_rejects() {
    let harness = Harness::new();
    let driver = RecordingDriver::blocking(definition("ZBSwitch", 1, false));
    let executor = spawn(&harness, &driver, 16);
    executor.start().unwrap();
    eventually(|| driver.entered() == 1).await;

    let queued = executor.fire(platform_event("test:Queued")).unwrap();
    let stopped = executor.stop().expect("stop handle");
    assert!(executor.stop().is_none());
    assert!(matches!(
        executor.fire(platform_event("test:Late")),
        Err(HubError::ExecutorStopped(_))
    ));

    driver.unblock();
    within(queued.wait()).await.unwrap();
    within(stopped.wait()).await.unwrap();
    assert_eq!(
        driver.event_names(),
        vec!["DriverStarted", "Message", "DriverStopped"]
    );
    eventually(|| executor.state() == ExecutorState::Stopped).await;
}

#[tokio::test]
async fn driver_errors_reach_the_caller_and_the_worker_survives() {
    let harness = Harness::new();
    let driver = RecordingDriver::failing_on(definition("ZBSwitch", 1, false), "Message");
    let executor = spawn(&harness, &driver, 8);
    executor.start().unwrap();

    let failed = within(executor.fire(platform_event("test:Boom")).unwrap().wait()).await;
    assert!(matches!(failed, Err(HubError::Msg(_))));

    let ok = executor
        .fire(DriverEvent::Associated { previous: None })
        .unwrap();
    within(ok.wait()).await.unwrap();
    assert!(executor.is_running());
}

#[tokio::test]
async fn attribute_sync_keeps_only_supported_keys() {
    let harness = Harness::new();
    let driver = RecordingDriver::new(definition("ZBSwitch", 1, false));
    let executor = spawn(&harness, &driver, 8);
    executor.start().unwrap();

    let ignored = executor
        .sync_attributes(
            AttributeMap::from([("dim:brightness".to_string(), json!(10))]),
            None,
            false,
        )
        .unwrap();
    assert!(ignored.is_none());

    let handle = executor
        .sync_attributes(
            AttributeMap::from([
                ("dim:brightness".to_string(), json!(10)),
                ("swit:state".to_string(), json!("ON")),
            ]),
            Some(3),
            true,
        )
        .unwrap()
        .expect("supported attribute");
    within(handle.wait()).await.unwrap();

    let updated = driver
        .events()
        .into_iter()
        .find_map(|e| match e {
            DriverEvent::AttributesUpdated {
                attributes,
                reflex_version,
                is_device_message,
            } => Some((attributes, reflex_version, is_device_message)),
            _ => None,
        })
        .unwrap();
    assert_eq!(
        updated,
        (
            AttributeMap::from([("swit:state".to_string(), json!("ON"))]),
            Some(3),
            true
        )
    );

    let context = executor.context().lock().await;
    assert_eq!(context.attribute("swit:state"), Some(&json!("ON")));
    assert!(context.attribute("dim:brightness").is_none());
}

#[tokio::test]
async fn connectivity_events_persist_and_broadcast_value_changes() {
    let harness = Harness::new();
    let driver = RecordingDriver::new(definition("ZBSwitch", 1, false));
    let executor = spawn(&harness, &driver, 8);
    executor.start().unwrap();

    let source = Address::Protocol(executor.protocol_address().cloned().unwrap());
    let online = ProtocolMessage::new(
        source,
        Address::Broadcast,
        ProtocolPayload::Control(ControlEvent::DeviceOnline { message: None }),
    );
    within(
        executor
            .fire(DriverEvent::Message(Message::Protocol(online)))
            .unwrap()
            .wait(),
    )
    .await
    .unwrap();

    assert!(executor.context().lock().await.is_connected());
    let device_id = executor.driver_address().device_id();
    assert_eq!(
        harness.dao.state(device_id).attributes.get("devconn:state"),
        Some(&json!("ONLINE"))
    );
    let changes = harness.platform_bus.of_type(names::VALUE_CHANGE);
    let last = changes.last().expect("value change");
    assert_eq!(last.header.source, Address::Driver(executor.driver_address()));
    assert_eq!(last.body.get_str("devconn:state"), Some("ONLINE"));
    assert_eq!(last.header.population.as_deref(), Some("general"));
}
