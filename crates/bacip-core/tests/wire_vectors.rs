//! Known-good frames captured from interoperating BACnet/IP devices.

use bacip_core::address::IpPort;
use bacip_core::apdu::{Apdu, ConfirmedRequest, MaxApdu, MaxSegments};
use bacip_core::bvll::BvllMessage;
use bacip_core::encoding::{reader::Reader, writer::Writer};
use bacip_core::npdu::Npci;
use bacip_core::object::{ObjectId, ObjectType};
use bacip_core::services::read_property::{ReadPropertyRequest, PROP_PRESENT_VALUE};
use bacip_core::services::who_is::WhoIsRequest;
use bacip_core::services::SERVICE_WHO_IS;

#[test]
fn global_who_is_frame() {
    let mut npdu = [0u8; 64];
    let mut w = Writer::new(&mut npdu);
    Npci::application(false)
        .with_destination(bacip_core::address::Address::GlobalBroadcast)
        .encode(&mut w)
        .unwrap();
    Apdu::UnconfirmedRequest {
        service_choice: SERVICE_WHO_IS,
        data: Vec::new(),
    }
    .encode(&mut w)
    .unwrap();

    let frame = BvllMessage::OriginalBroadcastNpdu {
        npdu: w.as_written().to_vec(),
    }
    .to_frame()
    .unwrap();

    assert_eq!(
        frame,
        vec![0x81, 0x0B, 0x00, 0x0C, 0x01, 0x20, 0xFF, 0xFF, 0x00, 0xFF, 0x10, 0x08]
    );
}

#[test]
fn unicast_read_property_frame() {
    let mut payload = [0u8; 16];
    let mut pw = Writer::new(&mut payload);
    ReadPropertyRequest {
        object_id: ObjectId::new(ObjectType::AnalogInput, 0),
        property_id: PROP_PRESENT_VALUE,
        array_index: None,
    }
    .encode(&mut pw)
    .unwrap();

    let mut npdu = [0u8; 64];
    let mut w = Writer::new(&mut npdu);
    Npci::application(true).encode(&mut w).unwrap();
    Apdu::ConfirmedRequest {
        header: ConfirmedRequest::unsegmented(
            1,
            0x0C,
            MaxSegments::Unspecified,
            MaxApdu::Octets1476,
            false,
        ),
        data: pw.as_written().to_vec(),
    }
    .encode(&mut w)
    .unwrap();

    let frame = BvllMessage::OriginalUnicastNpdu {
        npdu: w.as_written().to_vec(),
    }
    .to_frame()
    .unwrap();

    assert_eq!(
        frame,
        vec![
            0x81, 0x0A, 0x00, 0x11, 0x01, 0x04, 0x00, 0x05, 0x01, 0x0C, 0x0C, 0x00, 0x00, 0x00,
            0x00, 0x19, 0x55,
        ]
    );
}

#[test]
fn forwarded_npdu_carries_origin() {
    let frame = BvllMessage::ForwardedNpdu {
        origin: IpPort::new([10, 1, 2, 3], 47808),
        npdu: vec![0x01, 0x00, 0x10, 0x08],
    }
    .to_frame()
    .unwrap();
    assert_eq!(&frame[..4], &[0x81, 0x04, 0x00, 0x0E]);
    assert_eq!(&frame[4..10], &[10, 1, 2, 3, 0xBA, 0xC0]);

    let mut r = Reader::new(&frame);
    match BvllMessage::decode(&mut r).unwrap() {
        BvllMessage::ForwardedNpdu { origin, npdu } => {
            assert_eq!(origin, IpPort::new([10, 1, 2, 3], 47808));

            let mut nr = Reader::new(&npdu);
            let npci = Npci::decode(&mut nr).unwrap();
            assert!(!npci.is_network_message());
            match Apdu::decode(&mut nr).unwrap() {
                Apdu::UnconfirmedRequest {
                    service_choice,
                    data,
                } => {
                    assert_eq!(service_choice, SERVICE_WHO_IS);
                    let who_is = WhoIsRequest::decode(&mut Reader::new(&data)).unwrap();
                    assert_eq!(who_is, WhoIsRequest::global());
                }
                other => panic!("unexpected APDU {other:?}"),
            }
        }
        other => panic!("unexpected message {other:?}"),
    }
}
