//! Two stacks talking over loopback UDP.

use bacip_core::address::{Address, IpPort};
use bacip_core::encoding::{reader::Reader, writer::Writer};
use bacip_core::object::{ObjectId, ObjectType};
use bacip_core::services::read_property::{
    ReadPropertyAck, ReadPropertyRequest, PROP_PRESENT_VALUE,
};
use bacip_core::services::{SERVICE_READ_PROPERTY, SERVICE_WHO_IS};
use bacip_stack::app::ServiceAck;
use bacip_stack::{
    ApplicationDispatcher, Confirmation, LocalObject, ServiceError, Stack, StackConfig,
    StackHandle,
};
use std::net::{Ipv4Addr, SocketAddrV4};
use tokio::time::{timeout, Duration};

fn loopback_config(instance: u32) -> StackConfig {
    StackConfig::new(
        IpPort::from(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)),
        instance,
    )
}

fn dispatcher_for(instance: u32) -> ApplicationDispatcher {
    ApplicationDispatcher::new(LocalObject {
        id: ObjectId::new(ObjectType::Device, instance),
        name: format!("device-{instance}"),
    })
}

/// A responder with a ReadProperty handler that serves one analog input.
async fn spawn_responder(instance: u32) -> StackHandle {
    let mut dispatcher = dispatcher_for(instance);
    dispatcher
        .add_object(LocalObject {
            id: ObjectId::new(ObjectType::AnalogInput, 0),
            name: "zone-temp".into(),
        })
        .unwrap();
    dispatcher.register_confirmed(
        SERVICE_READ_PROPERTY,
        Box::new(|_: &Address, data: &[u8]| {
            let request = ReadPropertyRequest::decode(&mut Reader::new(data))
                .map_err(|_| ServiceError::Reject(bacip_core::apdu::RejectReason::InvalidTag))?;
            if request.property_id != PROP_PRESENT_VALUE {
                return Err(ServiceError::Execution {
                    class: 2,  // property
                    code: 32,  // unknown-property
                });
            }
            let ack = ReadPropertyAck {
                object_id: request.object_id,
                property_id: request.property_id,
                array_index: None,
                value: vec![0x44, 0x42, 0x91, 0x00, 0x00], // real 72.5
            };
            let mut buf = [0u8; 64];
            let mut w = Writer::new(&mut buf);
            ack.encode(&mut w).unwrap();
            Ok(ServiceAck::Complex(w.as_written().to_vec()))
        }),
    );

    let mut config = loopback_config(instance);
    config.vendor_id = 15;
    let (stack, handle) = Stack::bind(config, dispatcher).await.unwrap();
    tokio::spawn(stack.run());
    handle
}

fn read_property_payload() -> Vec<u8> {
    let request = ReadPropertyRequest {
        object_id: ObjectId::new(ObjectType::AnalogInput, 0),
        property_id: PROP_PRESENT_VALUE,
        array_index: None,
    };
    let mut buf = [0u8; 16];
    let mut w = Writer::new(&mut buf);
    request.encode(&mut w).unwrap();
    w.as_written().to_vec()
}

#[tokio::test]
async fn read_property_round_trip() {
    let server = spawn_responder(881000).await;
    let (client_stack, client) = Stack::bind(loopback_config(599), dispatcher_for(599))
        .await
        .unwrap();
    tokio::spawn(client_stack.run());

    let confirmation = timeout(
        Duration::from_secs(3),
        client.confirmed_request(
            Address::local_ip(server.local_addr()),
            SERVICE_READ_PROPERTY,
            read_property_payload(),
        ),
    )
    .await
    .expect("confirmation within the apdu timeout")
    .unwrap();

    match confirmation {
        Confirmation::ComplexAck {
            service_choice,
            data,
        } => {
            assert_eq!(service_choice, SERVICE_READ_PROPERTY);
            let ack = ReadPropertyAck::decode(&mut Reader::new(&data)).unwrap();
            assert_eq!(ack.value, vec![0x44, 0x42, 0x91, 0x00, 0x00]);
        }
        other => panic!("unexpected confirmation {other:?}"),
    }

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn unknown_service_is_rejected() {
    let server = spawn_responder(881001).await;
    let (client_stack, client) = Stack::bind(loopback_config(600), dispatcher_for(600))
        .await
        .unwrap();
    tokio::spawn(client_stack.run());

    let confirmation = timeout(
        Duration::from_secs(3),
        client.confirmed_request(
            Address::local_ip(server.local_addr()),
            0x1D, // no handler registered
            vec![],
        ),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(
        confirmation,
        Confirmation::Reject {
            reason: bacip_core::apdu::RejectReason::UnrecognizedService as u8
        }
    );

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn who_is_yields_i_am_and_populates_the_cache() {
    let server = spawn_responder(881002).await;

    // The observer registers an I-Am tap so the test can see delivery.
    let (i_am_tx, mut i_am_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut dispatcher = dispatcher_for(601);
    dispatcher.register_unconfirmed(
        bacip_core::services::SERVICE_I_AM,
        Box::new(move |source: &Address, data: &[u8]| {
            let i_am =
                bacip_core::services::i_am::IAmRequest::decode(&mut Reader::new(data)).unwrap();
            let _ = i_am_tx.send((*source, i_am));
        }),
    );
    let (client_stack, client) = Stack::bind(loopback_config(601), dispatcher).await.unwrap();
    tokio::spawn(client_stack.run());

    // Unicast Who-Is with a range around the responder's instance.
    client
        .who_is(
            Address::local_ip(server.local_addr()),
            Some((881000, 881005)),
        )
        .await
        .unwrap();

    let (source, i_am) = timeout(Duration::from_secs(3), i_am_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(source, Address::local_ip(server.local_addr()));
    assert_eq!(i_am.device_id.instance(), 881002);
    assert_eq!(i_am.vendor_id, 15);

    // A range that excludes the responder stays silent.
    client
        .who_is(Address::local_ip(server.local_addr()), Some((1, 10)))
        .await
        .unwrap();
    assert!(
        timeout(Duration::from_millis(500), i_am_rx.recv())
            .await
            .is_err(),
        "out-of-range Who-Is must not be answered"
    );

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn segmented_response_reassembles_end_to_end() {
    // Responder whose ComplexAck payload needs several segments.
    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let mut dispatcher = dispatcher_for(881003);
    dispatcher.register_confirmed(
        SERVICE_READ_PROPERTY,
        Box::new(
            move |_: &Address, _: &[u8]| -> Result<ServiceAck, ServiceError> {
                Ok(ServiceAck::Complex(payload.clone()))
            },
        ),
    );
    let mut server_config = loopback_config(881003);
    server_config.segmentation_supported = bacip_core::services::i_am::Segmentation::Both;
    let (server_stack, server) = Stack::bind(server_config, dispatcher).await.unwrap();
    tokio::spawn(server_stack.run());

    let mut client_config = loopback_config(604);
    client_config.segmentation_supported = bacip_core::services::i_am::Segmentation::Both;
    let (client_stack, client) = Stack::bind(client_config, dispatcher_for(604))
        .await
        .unwrap();
    tokio::spawn(client_stack.run());

    let confirmation = timeout(
        Duration::from_secs(5),
        client.confirmed_request(
            Address::local_ip(server.local_addr()),
            SERVICE_READ_PROPERTY,
            read_property_payload(),
        ),
    )
    .await
    .unwrap()
    .unwrap();

    match confirmation {
        Confirmation::ComplexAck { data, .. } => assert_eq!(data, expected),
        other => panic!("unexpected confirmation {other:?}"),
    }

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn request_to_a_silent_peer_times_out_with_no_response() {
    // Bind a socket that never answers.
    let silent = tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .unwrap();
    let silent_addr = match silent.local_addr().unwrap() {
        std::net::SocketAddr::V4(addr) => IpPort::from(addr),
        _ => unreachable!(),
    };

    let mut config = loopback_config(602);
    config.apdu_timeout = Duration::from_millis(100);
    config.number_of_apdu_retries = 2;
    let (client_stack, client) = Stack::bind(config, dispatcher_for(602)).await.unwrap();
    tokio::spawn(client_stack.run());

    let started = tokio::time::Instant::now();
    let confirmation = timeout(
        Duration::from_secs(5),
        client.confirmed_request(
            Address::local_ip(silent_addr),
            SERVICE_READ_PROPERTY,
            read_property_payload(),
        ),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(
        confirmation,
        Confirmation::Abort {
            reason: bacip_core::apdu::AbortReason::NoResponse as u8,
            from_server: false
        }
    );
    // Initial transmission plus two retries at 100 ms each.
    assert!(started.elapsed() >= Duration::from_millis(300));

    client.shutdown().await;
}

#[tokio::test]
async fn unconfirmed_whois_to_unbound_port_is_harmless() {
    // Sending into the void must not wedge or kill the stack.
    let (stack, handle) = Stack::bind(loopback_config(603), dispatcher_for(603))
        .await
        .unwrap();
    tokio::spawn(stack.run());

    handle
        .unconfirmed_request(
            Address::local_ip(IpPort::new([127, 0, 0, 1], 59999)),
            SERVICE_WHO_IS,
            vec![],
        )
        .await
        .unwrap();

    // The stack still answers commands afterwards.
    handle
        .who_is(Address::local_ip(handle.local_addr()), None)
        .await
        .unwrap();
    handle.shutdown().await;
}
