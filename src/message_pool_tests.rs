use super::*;
use crate::vsr::wire::Operation;
use proptest::prelude::*;

#[test]
fn acquire_sets_refcount_to_one() {
    let pool = MessagePool::new(1, 1);
    let msg = pool.get_message();
    assert!(msg.is_unique(), "Newly acquired message should have refcount 1");
    assert_eq!(msg.kind(), MessageKind::Full);
    assert_eq!(msg.buffer().len(), constants::MESSAGE_SIZE_MAX_PADDED_USIZE);

    let header = pool.get_header_only_message();
    assert!(header.is_unique());
    assert_eq!(header.kind(), MessageKind::HeaderOnly);
    assert_eq!(header.buffer().len(), constants::HEADER_SIZE_USIZE);
}

#[test]
fn acquire_resets_header() {
    let pool = MessagePool::new(1, 0);
    let mut msg = pool.get_message();
    {
        let mut h = msg.header_mut();
        h.command = Command::Request;
        h.client = 42;
    }
    msg.set_body(&[7u8; 32]);
    drop(msg);

    let msg = pool.get_message();
    let h = msg.header();
    assert_eq!(h.command, Command::Reserved);
    assert_eq!(h.client, 0);
    assert_eq!(h.size, Header::SIZE_MIN);
    assert_eq!(h.version, constants::VSR_VERSION);
    // Body bytes are not cleared between uses.
    assert_eq!(msg.buffer()[constants::HEADER_SIZE_USIZE], 7);
}

#[test]
fn last_release_returns_to_matching_free_list() {
    let pool = MessagePool::new(2, 2);

    let full = pool.get_message();
    let header = pool.get_header_only_message();
    assert_eq!(pool.free_count(MessageKind::Full), 1);
    assert_eq!(pool.free_count(MessageKind::HeaderOnly), 1);

    let full_ref = full.clone();
    assert_eq!(full.references(), 2);
    drop(full);
    assert_eq!(pool.free_count(MessageKind::Full), 1, "still referenced");
    drop(full_ref);
    assert_eq!(pool.free_count(MessageKind::Full), 2);
    assert_eq!(pool.free_count(MessageKind::HeaderOnly), 1);

    drop(header);
    assert_eq!(pool.free_count(MessageKind::HeaderOnly), 2);
    assert_eq!(pool.free_count(MessageKind::Full), 2);
}

#[test]
fn exhaustion_falls_back_to_transient_message() {
    let pool = MessagePool::new(1, 0);
    let first = pool.get_message();
    let second = pool.get_message();
    assert_eq!(pool.transient_count(), 1);
    assert!(second.is_unique());

    drop(second);
    assert_eq!(pool.free_count(MessageKind::Full), 0, "transient messages are not pooled");
    drop(first);
    assert_eq!(pool.free_count(MessageKind::Full), 1);

    let _header = pool.get_header_only_message();
    assert_eq!(pool.transient_count(), 2);
}

#[test]
fn pool_clone_shares_storage() {
    let pool1 = MessagePool::new(2, 0);
    let pool2 = pool1.clone();

    let msg1 = pool1.get_message();
    let _msg2 = pool2.get_message();
    assert_eq!(pool1.free_count(MessageKind::Full), 0);

    drop(msg1);
    assert_eq!(pool2.free_count(MessageKind::Full), 1);
}

#[test]
#[should_panic(expected = "message is shared")]
fn shared_message_cannot_be_mutated() {
    let pool = MessagePool::new(1, 0);
    let mut msg = pool.get_message();
    let _other = msg.clone();
    msg.header_mut().request = 1;
}

#[test]
fn try_buffer_mut_respects_sharing() {
    let pool = MessagePool::new(1, 0);
    let mut msg = pool.get_message();
    assert!(msg.try_buffer_mut().is_some());
    let other = msg.clone();
    assert!(msg.try_buffer_mut().is_none());
    assert!(msg.same_buffer(&other));
    drop(other);
    assert!(msg.try_buffer_mut().is_some());
}

#[test]
#[should_panic(expected = "body does not fit message buffer")]
fn header_only_message_rejects_body() {
    let pool = MessagePool::new(0, 1);
    let mut msg = pool.get_header_only_message();
    msg.set_body(&[1]);
}

#[test]
fn set_checksums_produces_valid_message() {
    let pool = MessagePool::new(1, 0);
    let mut msg = pool.get_message();
    {
        let mut h = msg.header_mut();
        h.command = Command::Request;
        h.operation = Operation::CreateAccounts;
        h.cluster = 3;
    }
    msg.set_body(b"ledger");
    msg.set_checksums();

    let h = msg.header();
    assert!(h.is_valid_checksum());
    assert!(h.is_valid_checksum_body(msg.body()));
    assert_eq!(msg.as_bytes().len(), constants::HEADER_SIZE_USIZE + 6);
}

proptest! {
    #[test]
    fn prop_pool_conserves_buffers(ops in proptest::collection::vec((any::<bool>(), any::<bool>()), 1..64)) {
        let pool = MessagePool::new(4, 4);
        let mut held: Vec<Message> = Vec::new();

        for (acquire, full) in ops {
            if acquire {
                let msg = if full { pool.get_message() } else { pool.get_header_only_message() };
                prop_assert_eq!(msg.references(), 1);
                held.push(msg);
            } else if let Some(msg) = held.pop() {
                drop(msg);
            }
            let full_held = held.iter().filter(|m| m.kind() == MessageKind::Full).count();
            let headers_held = held.len() - full_held;
            prop_assert_eq!(pool.free_count(MessageKind::Full), 4usize.saturating_sub(full_held));
            prop_assert_eq!(pool.free_count(MessageKind::HeaderOnly), 4usize.saturating_sub(headers_held));
        }

        held.clear();
        prop_assert_eq!(pool.free_count(MessageKind::Full), 4);
        prop_assert_eq!(pool.free_count(MessageKind::HeaderOnly), 4);
    }
}
