//! Peripheral bridge behaviour driven through the recording transport

use std::sync::Arc;

use bitchat_gatt::peripheral::NativeAttRequest;
use bitchat_gatt::protocol::{uuid_from_u16, CLIENT_CHARACTERISTIC_CONFIGURATION_UUID};
use bitchat_gatt::testing::{PeripheralCommand, RecordingPeripheralTransport};
use bitchat_gatt::{
    Advertisement, AttError, AttributeId, AttributePermissions, BridgeConfig, BridgeError, CancelReason, CentralId,
    CharacteristicDefinition, CharacteristicProperties, DescriptorDefinition, LocalService, NativeHandle,
    PeripheralBridge, PeripheralCallback, PeripheralEvent, ServiceDefinition, TransportError,
};
use tokio::sync::mpsc;
use tokio_test::{assert_pending, assert_ready_err, assert_ready_ok, task};
use tracing_subscriber::EnvFilter;

type Bridge = PeripheralBridge<RecordingPeripheralTransport>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn setup() -> (Bridge, mpsc::UnboundedReceiver<PeripheralEvent>) {
    init_tracing();
    PeripheralBridge::new(Arc::new(RecordingPeripheralTransport::new()), BridgeConfig::default())
}

fn drain(events: &mut mpsc::UnboundedReceiver<PeripheralEvent>) -> Vec<PeripheralEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

fn chat_service() -> ServiceDefinition {
    let inbox = CharacteristicDefinition::new(
        uuid_from_u16(0xfe01),
        CharacteristicProperties::READ | CharacteristicProperties::WRITE | CharacteristicProperties::NOTIFY,
        AttributePermissions::READABLE | AttributePermissions::WRITEABLE,
    )
    .with_descriptor(DescriptorDefinition::new(CLIENT_CHARACTERISTIC_CONFIGURATION_UUID));
    let outbox = CharacteristicDefinition::new(
        uuid_from_u16(0xfe02),
        CharacteristicProperties::WRITE,
        AttributePermissions::WRITEABLE,
    );
    ServiceDefinition::new(uuid_from_u16(0xfe00))
        .with_included_service(
            ServiceDefinition::new(uuid_from_u16(0x180f))
                .secondary()
                .with_characteristic(
                    CharacteristicDefinition::new(
                        uuid_from_u16(0x2a19),
                        CharacteristicProperties::READ,
                        AttributePermissions::READABLE,
                    )
                    .with_value(vec![100]),
                ),
        )
        .with_characteristic(inbox)
        .with_characteristic(outbox)
}

async fn published(bridge: &Bridge) -> LocalService {
    let definition = chat_service();
    let mut add = task::spawn(bridge.add_service(&definition));
    assert_pending!(add.poll());
    let Some(PeripheralCommand::AddService(submitted)) = bridge.transport().commands().last().cloned() else {
        panic!("service was not submitted");
    };
    bridge
        .handle_callback(PeripheralCallback::ServiceAdded {
            service: submitted.id,
            result: Ok(()),
        })
        .await;
    let service = assert_ready_ok!(add.poll());
    assert_eq!(service, submitted);
    service
}

fn native_request(handle: u64, central: &CentralId, attribute: AttributeId, value: Option<Vec<u8>>) -> NativeAttRequest {
    NativeAttRequest {
        handle: NativeHandle::new(handle),
        central: central.clone(),
        maximum_update_length: 182,
        attribute,
        offset: 0,
        value,
    }
}

#[tokio::test]
async fn test_add_service_assigns_every_identity() {
    let (bridge, _events) = setup();
    let service = published(&bridge).await;

    let ids = service.identities();
    assert_eq!(ids.len(), 6);
    assert_eq!(*ids.last().unwrap(), service.id);
    for id in &ids {
        let node = bridge.attribute(*id).await.unwrap();
        assert_eq!(node.id, *id);
    }

    let battery = service.characteristic(uuid_from_u16(0x2a19)).unwrap();
    let node = bridge.attribute(battery.id).await.unwrap();
    assert_eq!(node.value, Some(vec![100]));
    assert_eq!(node.parent, Some(service.included_services[0].id));
    assert_eq!(bridge.services().await, vec![service.id]);
}

#[tokio::test]
async fn test_rejected_service_leaves_no_identities() {
    let (bridge, _events) = setup();
    let definition = chat_service();
    let mut add = task::spawn(bridge.add_service(&definition));
    assert_pending!(add.poll());
    let Some(PeripheralCommand::AddService(submitted)) = bridge.transport().commands().pop() else {
        panic!("service was not submitted");
    };

    let error = TransportError::new(9, "too many services");
    bridge
        .handle_callback(PeripheralCallback::ServiceAdded {
            service: submitted.id,
            result: Err(error.clone()),
        })
        .await;

    assert_eq!(assert_ready_err!(add.poll()), BridgeError::Transport(error));
    for id in submitted.identities() {
        assert_eq!(bridge.attribute(id).await, Err(BridgeError::UnknownAttribute { id }));
    }
    assert!(bridge.services().await.is_empty());
}

#[tokio::test]
async fn test_malformed_tree_is_rejected_before_submission() {
    let (bridge, _events) = setup();
    let mut definition = chat_service();
    definition.characteristics[1].as_mut().unwrap().descriptors.push(None);

    let err = bridge.add_service(&definition).await.unwrap_err();
    assert!(matches!(err, BridgeError::MalformedAttributeTree { .. }));
    assert!(bridge.transport().commands().is_empty());
    assert!(bridge.services().await.is_empty());
}

#[tokio::test]
async fn test_remove_service_drops_subtree() {
    let (bridge, _events) = setup();
    let first = published(&bridge).await;
    let second = published(&bridge).await;

    bridge.remove_service(first.id).await.unwrap();
    assert_eq!(
        bridge.transport().commands().last(),
        Some(&PeripheralCommand::RemoveService(first.id))
    );
    for id in first.identities() {
        assert!(bridge.attribute(id).await.is_err());
    }
    for id in second.identities() {
        assert!(bridge.attribute(id).await.is_ok());
    }
    assert_eq!(bridge.services().await, vec![second.id]);

    bridge.remove_all_services().await;
    assert!(bridge.services().await.is_empty());
    assert_eq!(bridge.attribute(second.id).await, Err(BridgeError::UnknownAttribute { id: second.id }));
}

#[tokio::test]
async fn test_removal_cancels_pending_registration() {
    let (bridge, _events) = setup();
    let definition = chat_service();
    let mut add = task::spawn(bridge.add_service(&definition));
    assert_pending!(add.poll());
    let Some(PeripheralCommand::AddService(submitted)) = bridge.transport().commands().pop() else {
        panic!("service was not submitted");
    };

    bridge.remove_service(submitted.id).await.unwrap();
    assert_eq!(
        assert_ready_err!(add.poll()),
        BridgeError::Cancelled(CancelReason::ServiceRemoved)
    );

    // the late confirmation has nothing left to resolve
    bridge
        .handle_callback(PeripheralCallback::ServiceAdded {
            service: submitted.id,
            result: Ok(()),
        })
        .await;
    assert!(bridge.services().await.is_empty());
}

#[tokio::test]
async fn test_remove_all_cancels_every_pending_registration() {
    let (bridge, _events) = setup();
    let kept = published(&bridge).await;
    let first = chat_service();
    let second = chat_service();
    let mut add_first = task::spawn(bridge.add_service(&first));
    let mut add_second = task::spawn(bridge.add_service(&second));
    assert_pending!(add_first.poll());
    assert_pending!(add_second.poll());

    bridge.remove_all_services().await;

    for add in [&mut add_first, &mut add_second] {
        assert_eq!(
            assert_ready_err!(add.poll()),
            BridgeError::Cancelled(CancelReason::ServiceRemoved)
        );
    }
    bridge
        .handle_callback(PeripheralCallback::ServiceAdded {
            service: kept.id,
            result: Ok(()),
        })
        .await;
    assert!(bridge.services().await.is_empty());
    assert_eq!(bridge.attribute(kept.id).await, Err(BridgeError::UnknownAttribute { id: kept.id }));
}

#[tokio::test]
async fn test_read_request_round_trip() {
    let (bridge, mut events) = setup();
    let service = published(&bridge).await;
    let inbox = service.characteristic(uuid_from_u16(0xfe01)).unwrap().id;
    let central = CentralId::new("central-1");

    bridge
        .handle_callback(PeripheralCallback::ReadRequest(native_request(0x40, &central, inbox, None)))
        .await;
    let Some(PeripheralEvent::ReadRequested(request)) = drain(&mut events).pop() else {
        panic!("read was not forwarded");
    };
    assert_eq!(request.attribute, inbox);
    assert_eq!(request.central, central);
    assert_eq!(bridge.outstanding_requests().await, 1);
    assert_eq!(bridge.maximum_notify_length(&central).await, Ok(182));

    bridge
        .respond(request.id, Some(b"hello"), AttError::Success)
        .await
        .unwrap();
    assert_eq!(
        bridge.transport().responses(),
        vec![(NativeHandle::new(0x40), Some(b"hello".to_vec()), AttError::Success)]
    );
    assert_eq!(bridge.outstanding_requests().await, 0);

    // each request is answered once
    assert_eq!(
        bridge.respond(request.id, None, AttError::Success).await,
        Err(BridgeError::UnknownRequest { id: request.id })
    );
}

#[tokio::test]
async fn test_unknown_attribute_request_leaves_no_record() {
    let (bridge, mut events) = setup();
    let service = published(&bridge).await;
    let central = CentralId::new("central-1");
    let stale = AttributeId::from_raw(u64::MAX);

    bridge
        .handle_callback(PeripheralCallback::ReadRequest(native_request(0x41, &central, stale, None)))
        .await;
    // a service is not a readable attribute either
    bridge
        .handle_callback(PeripheralCallback::ReadRequest(native_request(0x42, &central, service.id, None)))
        .await;

    assert!(drain(&mut events).is_empty());
    assert_eq!(bridge.outstanding_requests().await, 0);
    assert_eq!(
        bridge.transport().responses(),
        vec![
            (NativeHandle::new(0x41), None, AttError::AttributeNotFound),
            (NativeHandle::new(0x42), None, AttError::AttributeNotFound),
        ]
    );
}

#[tokio::test]
async fn test_write_batch_is_forwarded_whole() {
    let (bridge, mut events) = setup();
    let service = published(&bridge).await;
    let inbox = service.characteristic(uuid_from_u16(0xfe01)).unwrap().id;
    let outbox = service.characteristic(uuid_from_u16(0xfe02)).unwrap().id;
    let central = CentralId::new("central-1");

    bridge
        .handle_callback(PeripheralCallback::WriteRequests(vec![
            native_request(0x50, &central, inbox, Some(vec![1, 2])),
            native_request(0x51, &central, outbox, Some(vec![3])),
        ]))
        .await;

    let Some(PeripheralEvent::WriteRequested(batch)) = drain(&mut events).pop() else {
        panic!("write batch was not forwarded");
    };
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].value, Some(vec![1, 2]));
    assert_eq!(batch[1].attribute, outbox);
    assert_ne!(batch[0].id, batch[1].id);
    assert_eq!(bridge.outstanding_requests().await, 2);

    for request in &batch {
        bridge.respond(request.id, None, AttError::Success).await.unwrap();
    }
    assert_eq!(bridge.outstanding_requests().await, 0);
}

#[tokio::test]
async fn test_write_batch_with_unknown_target_is_refused() {
    let (bridge, mut events) = setup();
    let service = published(&bridge).await;
    let inbox = service.characteristic(uuid_from_u16(0xfe01)).unwrap().id;
    let central = CentralId::new("central-1");

    bridge
        .handle_callback(PeripheralCallback::WriteRequests(vec![
            native_request(0x60, &central, inbox, Some(vec![1])),
            native_request(0x61, &central, AttributeId::from_raw(u64::MAX), Some(vec![2])),
        ]))
        .await;

    assert!(drain(&mut events).is_empty());
    assert_eq!(bridge.outstanding_requests().await, 0);
    assert_eq!(
        bridge.transport().responses(),
        vec![(NativeHandle::new(0x61), None, AttError::AttributeNotFound)]
    );
}

#[tokio::test]
async fn test_subscription_and_update_value() {
    let (bridge, mut events) = setup();
    let service = published(&bridge).await;
    let inbox = service.characteristic(uuid_from_u16(0xfe01)).unwrap().id;
    let central = CentralId::new("central-1");

    bridge
        .handle_callback(PeripheralCallback::Subscribed {
            central: central.clone(),
            maximum_update_length: 244,
            characteristic: inbox,
        })
        .await;
    assert_eq!(
        drain(&mut events),
        vec![PeripheralEvent::NotifyStateChanged {
            central: central.clone(),
            characteristic: inbox,
            enabled: true,
        }]
    );
    assert_eq!(bridge.maximum_notify_length(&central).await, Ok(244));

    let targets = [central.clone()];
    assert_eq!(bridge.update_value(inbox, b"ping", Some(&targets[..])).await, Ok(true));
    assert_eq!(
        bridge.transport().commands().last(),
        Some(&PeripheralCommand::UpdateValue {
            characteristic: inbox,
            value: b"ping".to_vec(),
            centrals: Some(vec![central.clone()]),
        })
    );

    bridge.transport().set_accept_updates(false);
    assert_eq!(bridge.update_value(inbox, b"pong", None).await, Ok(false));
    bridge
        .handle_callback(PeripheralCallback::ReadyToUpdateSubscribers)
        .await;
    assert_eq!(drain(&mut events), vec![PeripheralEvent::ReadyToUpdateSubscribers]);

    bridge
        .handle_callback(PeripheralCallback::Unsubscribed {
            central: central.clone(),
            maximum_update_length: 244,
            characteristic: inbox,
        })
        .await;
    assert_eq!(
        drain(&mut events),
        vec![PeripheralEvent::NotifyStateChanged {
            central,
            characteristic: inbox,
            enabled: false,
        }]
    );
}

#[tokio::test]
async fn test_update_value_validates_targets() {
    let (bridge, _events) = setup();
    let service = published(&bridge).await;
    let inbox = service.characteristic(uuid_from_u16(0xfe01)).unwrap().id;
    let stranger = CentralId::new("central-9");

    let targets = [stranger.clone()];
    assert_eq!(
        bridge.update_value(inbox, b"x", Some(&targets[..])).await,
        Err(BridgeError::UnknownCentral { central: stranger })
    );
    assert_eq!(
        bridge.update_value(service.id, b"x", None).await,
        Err(BridgeError::AttributeKindMismatch {
            id: service.id,
            expected: "characteristic"
        })
    );
}

#[tokio::test]
async fn test_advertising_start_is_exclusive() {
    let (bridge, _events) = setup();
    let advertisement = Advertisement::new()
        .with_name("bitchat")
        .with_service_uuid(uuid_from_u16(0xfe00));

    let mut first = task::spawn(bridge.start_advertising(&advertisement));
    assert_pending!(first.poll());
    let second = bridge.start_advertising(&advertisement).await;
    assert!(matches!(second, Err(BridgeError::OperationInProgress { .. })));

    bridge
        .handle_callback(PeripheralCallback::AdvertisingStarted { result: Ok(()) })
        .await;
    assert_ready_ok!(first.poll());
    assert!(bridge.is_advertising());

    bridge.stop_advertising();
    assert!(!bridge.is_advertising());
}

#[tokio::test]
async fn test_initialize_cancels_pending_registrations() {
    let (bridge, mut events) = setup();
    let central = CentralId::new("central-1");
    let existing = published(&bridge).await;
    let inbox = existing.characteristic(uuid_from_u16(0xfe01)).unwrap().id;
    bridge
        .handle_callback(PeripheralCallback::ReadRequest(native_request(0x70, &central, inbox, None)))
        .await;
    drain(&mut events);

    let definition = chat_service();
    let advertisement = Advertisement::new();
    let mut add = task::spawn(bridge.add_service(&definition));
    let mut advertise = task::spawn(bridge.start_advertising(&advertisement));
    assert_pending!(add.poll());
    assert_pending!(advertise.poll());

    bridge.initialize().await;

    assert_eq!(assert_ready_err!(add.poll()), BridgeError::Cancelled(CancelReason::Reset));
    assert_eq!(
        assert_ready_err!(advertise.poll()),
        BridgeError::Cancelled(CancelReason::Reset)
    );
    assert!(bridge.services().await.is_empty());
    assert_eq!(bridge.outstanding_requests().await, 0);
    assert!(bridge.maximum_notify_length(&central).await.is_err());
    assert!(!bridge.is_advertising());
    assert!(bridge
        .transport()
        .commands()
        .contains(&PeripheralCommand::RemoveAllServices));
}

#[tokio::test]
async fn test_show_app_settings_depends_on_host() {
    let (bridge, _events) = setup();
    assert_eq!(
        bridge.show_app_settings(),
        Err(BridgeError::Unsupported {
            operation: "showAppSettings"
        })
    );
    bridge.transport().set_app_settings_supported(true);
    bridge.show_app_settings().unwrap();
    assert_eq!(bridge.transport().commands(), vec![PeripheralCommand::ShowAppSettings]);
}
