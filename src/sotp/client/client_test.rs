use bytes::Bytes;

use super::*;

const TAG: u16 = 0xab01;

fn testing_worker() -> ClientWorker {
    ClientWorker::new(b"secret", 3, 16, TAG).unwrap()
}

fn from_wrapper(packet: &Packet) -> Message {
    Message::stream(Endpoint::Wrapper, 0, Endpoint::Sotp, 0, packet.marshal().unwrap())
}

fn from_data_task(data: &[u8]) -> Message {
    Message::stream(
        Endpoint::DataTask,
        0,
        Endpoint::Sotp,
        0,
        Bytes::copy_from_slice(data),
    )
}

fn sent_packet(msg: &Message) -> Packet {
    assert_eq!(msg.receiver, Endpoint::Wrapper);
    Packet::unmarshal(msg.stream_content().unwrap()).unwrap()
}

/// Runs the handshake: Start signal, then the server's Response-Auth.
/// Returns the worker in Working state and the client's last seq number.
fn started_worker(sid: u8) -> (ClientWorker, u16) {
    let mut worker = testing_worker();

    let start = Message::signal(Endpoint::Overlay, 0, Endpoint::Sotp, 0, Signal::Start);
    let answers = worker.entrypoint(&start).unwrap();
    assert_eq!(answers.len(), 1);
    let init = sent_packet(&answers[0]);
    assert_eq!(init.session_id, 0);
    assert_eq!(init.seq_number, 1);
    assert_eq!(init.ack, 0);
    assert!(init.is_sync_type(SyncType::RequestAuth));
    assert_eq!(init.content.as_ref(), &TAG.to_be_bytes());
    assert_eq!(worker.status(), Status::Initializing);
    assert!(worker.wait_reply);

    let auth = Packet {
        session_id: sid,
        seq_number: 1,
        ack: 1,
        flags: FLAG_SYNC,
        sync_type: Some(SyncType::ResponseAuth),
        content: Bytes::new(),
    };
    let answers = worker.entrypoint(&from_wrapper(&auth)).unwrap();
    assert_eq!(worker.status(), Status::Working);
    assert_eq!(answers.len(), 1);
    let first = sent_packet(&answers[0]);
    assert_eq!(first.session_id, sid);
    assert!(first.is_sync_type(SyncType::Poll));
    (worker, first.seq_number)
}

#[test]
fn test_handshake_to_working() {
    let (worker, seq) = started_worker(7);
    assert_eq!(seq, 2);
    assert!(worker.wait_reply);
}

#[test]
fn test_ack_chains_to_last_received_seq() {
    let (mut worker, mut seq) = started_worker(7);
    let mut server_seq = 1u16;

    // A few empty poll responses followed by overlay submissions: every
    // emitted packet must ack the seq of the packet it answers.
    for round in 0..4u16 {
        server_seq += 1;
        let response = Packet {
            session_id: 7,
            seq_number: server_seq,
            ack: seq,
            ..Default::default()
        };
        worker.entrypoint(&from_data_task(b"ping")).unwrap();
        let answers = worker.entrypoint(&from_wrapper(&response)).unwrap();
        let sent = sent_packet(answers.last().unwrap());
        assert_eq!(sent.ack, server_seq, "round {round}");
        assert_eq!(sent.seq_number, seq + 1, "round {round}");
        seq = sent.seq_number;
    }
}

#[test]
fn test_push_delivery_reassembles_payload() {
    let (mut worker, seq) = started_worker(9);

    // Mirror of the worker's cipher: the server encrypts with the same
    // keystream position (fresh ciphers, first payload each way).
    let mut server_cipher = crate::sotp::cipher::StreamCipher::new(b"secret");
    let ciphertext = server_cipher.crypt(b"response payload");
    let (first, second) = (ciphertext.slice(0..5), ciphertext.slice(5..));

    let part1 = Packet {
        session_id: 9,
        seq_number: 2,
        ack: seq,
        content: first,
        ..Default::default()
    };
    let answers = worker.entrypoint(&from_wrapper(&part1)).unwrap();
    // Mid-payload chunk: no overlay delivery yet, ack reply only.
    assert_eq!(answers.len(), 1);
    let ack = sent_packet(&answers[0]);
    assert_eq!(ack.flags, FLAG_NONE);
    assert!(!ack.has_content());

    let part2 = Packet {
        session_id: 9,
        seq_number: 3,
        ack: ack.seq_number,
        flags: FLAG_PUSH,
        sync_type: None,
        content: second,
    };
    let answers = worker.entrypoint(&from_wrapper(&part2)).unwrap();
    assert_eq!(answers.len(), 2);
    assert_eq!(answers[0].receiver, Endpoint::Overlay);
    assert_eq!(
        answers[0].stream_content().unwrap().as_ref(),
        b"response payload"
    );
    assert!(sent_packet(&answers[1]).is_sync_type(SyncType::Poll));
}

#[test]
fn test_overlay_payload_chunked_with_single_push() {
    let (mut worker, mut seq) = started_worker(5);
    let mut server_seq = 1u16;

    // Idle the machine first so the submission starts a transfer.
    server_seq += 1;
    let idle = Packet {
        session_id: 5,
        seq_number: server_seq,
        ack: seq,
        ..Default::default()
    };
    let answers = worker.entrypoint(&from_wrapper(&idle)).unwrap();
    assert!(answers.is_empty());
    assert!(!worker.wait_reply);

    // 40 bytes with max_size 16: three chunks, exactly one PUSH.
    let answers = worker.entrypoint(&from_data_task(&[0x55u8; 40])).unwrap();
    assert_eq!(answers.len(), 1);
    let mut pushes = 0;
    let mut chunks = vec![sent_packet(&answers[0])];
    while !chunks.last().unwrap().is_push() {
        server_seq += 1;
        seq = chunks.last().unwrap().seq_number;
        let response = Packet {
            session_id: 5,
            seq_number: server_seq,
            ack: seq,
            ..Default::default()
        };
        let answers = worker.entrypoint(&from_wrapper(&response)).unwrap();
        chunks.push(sent_packet(&answers[0]));
    }
    for chunk in &chunks {
        if chunk.is_push() {
            pushes += 1;
        }
    }
    assert_eq!(chunks.len(), 3);
    assert_eq!(pushes, 1);
    assert!(worker.sotp_first_push);
}

#[test]
fn test_retry_resends_same_packet() {
    let (mut worker, seq) = started_worker(3);

    let before = worker.seq_number();
    let answers = worker.look_for_retries().unwrap();
    assert_eq!(answers.len(), 1);
    let resent = sent_packet(&answers[0]);
    assert_eq!(resent.seq_number, seq);
    assert_eq!(worker.seq_number(), before, "retry must not consume seq");
}

#[test]
fn test_retries_exhausted_emits_single_comms_broken() {
    let (mut worker, _) = started_worker(3);

    // max_retries is 3: three resends, then exactly one CommsBroken.
    for _ in 0..3 {
        let answers = worker.look_for_retries().unwrap();
        assert_eq!(answers[0].receiver, Endpoint::Wrapper);
    }
    let answers = worker.look_for_retries().unwrap();
    assert_eq!(answers.len(), 1);
    assert!(answers[0].is_signal(Signal::CommsBroken));
    assert_eq!(answers[0].receiver, Endpoint::Overlay);
}

#[test]
fn test_malformed_response_takes_retry_path() {
    let (mut worker, seq) = started_worker(4);

    let garbage = Message::stream(
        Endpoint::Wrapper,
        0,
        Endpoint::Sotp,
        0,
        Bytes::from_static(&[0x01, 0x02]),
    );
    let answers = worker.entrypoint(&garbage).unwrap();
    assert_eq!(sent_packet(&answers[0]).seq_number, seq);
}

#[test]
fn test_ack_mismatch_takes_retry_path() {
    let (mut worker, seq) = started_worker(4);

    let response = Packet {
        session_id: 4,
        seq_number: 2,
        ack: seq + 10,
        ..Default::default()
    };
    let answers = worker.entrypoint(&from_wrapper(&response)).unwrap();
    assert_eq!(sent_packet(&answers[0]).seq_number, seq);
}

#[test]
fn test_reinitialization_roundtrip() {
    let (mut worker, seq) = started_worker(6);

    // Idle the machine, then fast-forward the counter so the next poll
    // carries the next-to-last sequence number.
    let idle = Packet {
        session_id: 6,
        seq_number: 2,
        ack: seq,
        ..Default::default()
    };
    worker.entrypoint(&from_wrapper(&idle)).unwrap();
    worker.force_seq_number(MAX_SEQ_NUMBER - 2);

    let answers = worker.get_poll_request().unwrap();
    let poll = sent_packet(&answers[0]);
    assert_eq!(poll.seq_number, MAX_SEQ_NUMBER - 1);

    // Server acks it: client must switch to Reinit instead of wrapping.
    let response = Packet {
        session_id: 6,
        seq_number: 3,
        ack: poll.seq_number,
        ..Default::default()
    };
    let answers = worker.entrypoint(&from_wrapper(&response)).unwrap();
    let reinit = sent_packet(&answers[0]);
    assert!(reinit.is_sync_type(SyncType::Reinit));
    assert_eq!(reinit.seq_number, MAX_SEQ_NUMBER);
    assert_eq!(worker.status(), Status::Reinitializing);

    // Server resets its own seq to 1 and acks the reinit.
    let reinit_ok = Packet {
        session_id: 6,
        seq_number: 1,
        ack: reinit.seq_number,
        ..Default::default()
    };
    let answers = worker.entrypoint(&from_wrapper(&reinit_ok)).unwrap();
    assert!(answers.is_empty());
    assert_eq!(worker.status(), Status::Working);

    // User data resumes from seq 1.
    let answers = worker.entrypoint(&from_data_task(b"after reinit")).unwrap();
    let transfer = sent_packet(&answers[0]);
    assert_eq!(transfer.seq_number, 1);
    assert!(transfer.is_push());
}

#[test]
fn test_server_termination_request() {
    let (mut worker, seq) = started_worker(8);

    let term = Packet {
        session_id: 8,
        seq_number: 2,
        ack: seq,
        flags: FLAG_SYNC,
        sync_type: Some(SyncType::Terminate),
        content: Bytes::new(),
    };
    let answers = worker.entrypoint(&from_wrapper(&term)).unwrap();
    assert_eq!(answers.len(), 2);
    assert!(answers[0].is_signal(Signal::CommsFinished));
    let reply = sent_packet(&answers[1]);
    assert_eq!(reply.ack, 2);
    assert_eq!(worker.status(), Status::Terminating);

    // Any further wrapper traffic completes the teardown.
    let trailing = Packet {
        session_id: 8,
        seq_number: 3,
        ack: reply.seq_number,
        ..Default::default()
    };
    let answers = worker.entrypoint(&from_wrapper(&trailing)).unwrap();
    assert_eq!(worker.status(), Status::NotInitializing);
    assert!(answers[0].is_signal(Signal::CommsFinished));
}

#[test]
fn test_terminate_signal_sends_termination_request() {
    let (mut worker, _) = started_worker(2);

    let terminate = Message::signal(Endpoint::Overlay, 0, Endpoint::Sotp, 0, Signal::Terminate);
    let answers = worker.entrypoint(&terminate).unwrap();
    assert_eq!(answers.len(), 3);
    let term = sent_packet(&answers[0]);
    assert!(term.is_sync_type(SyncType::Terminate));
    assert!(answers[1].is_terminate());
    assert_eq!(answers[1].receiver, Endpoint::Wrapper);
    assert!(answers[2].is_terminate());
    assert_eq!(answers[2].receiver, Endpoint::DataTask);
    assert!(worker.exit);
}

#[test]
fn test_stop_signal_enters_stopping() {
    let (mut worker, seq) = started_worker(2);

    let stop = Message::signal(Endpoint::Overlay, 0, Endpoint::Sotp, 0, Signal::Stop);
    assert!(worker.entrypoint(&stop).unwrap().is_empty());
    assert_eq!(worker.status(), Status::Stopping);

    // The next response drives the Terminate round-trip.
    let response = Packet {
        session_id: 2,
        seq_number: 2,
        ack: seq,
        ..Default::default()
    };
    let answers = worker.entrypoint(&from_wrapper(&response)).unwrap();
    let term = sent_packet(&answers[0]);
    assert!(term.is_sync_type(SyncType::Terminate));
    assert_eq!(worker.status(), Status::Terminating);
}
