use nfc_rw::protocol::{Command, I93Command, I93Request, T1tCommand, T2tCommand};
use nfc_rw::{I93Uid, Protocol, T1tUid};

const SLIX: [u8; 8] = [0xE0, 0x04, 0x01, 0x00, 0x11, 0x22, 0x33, 0x44];

fn wire(uid: [u8; 8]) -> Vec<u8> {
    uid.iter().rev().copied().collect()
}

#[test]
fn type1_frames_carry_uid_echo() {
    let uid = T1tUid::from_bytes([0xAA, 0xBB, 0xCC, 0xDD]);
    let cmd = Command::Type1 {
        op: T1tCommand::WriteErase {
            block: 2,
            byte: 3,
            value: 0x5A,
        },
        uid,
    };
    assert_eq!(cmd.protocol(), Protocol::Type1);
    assert_eq!(cmd.encode(), vec![0x53, 0x13, 0x5A, 0xAA, 0xBB, 0xCC, 0xDD]);

    let seg = Command::Type1 {
        op: T1tCommand::ReadSegment { segment: 2 },
        uid,
    }
    .encode();
    assert_eq!(seg.len(), 14);
    assert_eq!(&seg[..2], &[0x10, 0x20]);
}

#[test]
fn type2_read_write_and_sector_select() {
    assert_eq!(Command::Type2(T2tCommand::Read { block: 4 }).encode(), vec![0x30, 0x04]);
    assert_eq!(
        T2tCommand::Write {
            block: 5,
            data: [1, 2, 3, 4]
        }
        .encode(),
        vec![0xA2, 0x05, 1, 2, 3, 4]
    );
    assert_eq!(T2tCommand::SectorSelect.encode(), vec![0xC2, 0xFF]);
    assert_eq!(T2tCommand::SectorChange { sector: 1 }.encode(), vec![1, 0, 0, 0]);
    assert!(!T2tCommand::SectorChange { sector: 1 }.expects_response());
}

#[test]
fn iso15693_addressed_read_puts_uid_lsb_first() {
    let uid = I93Uid::from_bytes(SLIX);
    let frame = I93Request::new(I93Command::ReadSingleBlock { block: 7 }, uid).encode();
    assert_eq!(frame[0], 0x22);
    assert_eq!(frame[1], 0x20);
    assert_eq!(&frame[2..10], wire(SLIX).as_slice());
    assert_eq!(frame[10], 7);
    assert_eq!(frame.len(), 11);
}

#[test]
fn iso15693_option_and_extension_flags() {
    let uid = I93Uid::from_bytes(SLIX);
    let req = I93Request::new(I93Command::ReadMultipleBlocks { first: 0x0102, count: 4 }, uid)
        .with_option(true)
        .with_extended(true);
    assert_eq!(req.flags(), 0x22 | 0x40 | 0x08);
    let frame = req.encode();
    assert_eq!(&frame[10..], &[0x02, 0x01, 0x03]);
}

#[test]
fn iso15693_inventory_with_afi_and_mask() {
    let uid = I93Uid::from_bytes(SLIX);
    let frame = I93Request::new(
        I93Command::Inventory {
            afi: Some(0x05),
            mask_uid: Some(uid),
        },
        I93Uid::default(),
    )
    .encode();
    assert_eq!(frame[0], 0x26 | 0x10);
    assert_eq!(&frame[1..4], &[0x01, 0x05, 64]);
    assert_eq!(&frame[4..], wire(SLIX).as_slice());

    let plain = I93Request::new(
        I93Command::Inventory {
            afi: None,
            mask_uid: None,
        },
        I93Uid::default(),
    )
    .encode();
    assert_eq!(plain, vec![0x26, 0x01, 0x00]);
}
