// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

mod common;

use std::time::Duration;

use common::*;
use sip_tm::{
    CancelOutcome, MatchMode, RequestMatch, ResponseMatch, TmConfig, TmError, TransactionState,
};
use smol_str::SmolStr;

#[tokio::test(start_paused = true)]
async fn cancel_without_invite_gets_481() {
    let (engine, recorder) = engine();
    let err = engine.cancel(&cancel_for(&invite("ghost"))).await.unwrap_err();
    assert!(matches!(err, TmError::NoMatchingTransaction));
    assert_eq!(recorder.upstream_codes(), vec![481]);
    assert_eq!(engine.stats().cancels_received, 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_of_ringing_invite() {
    let (engine, recorder) = engine();
    let request = invite("ringing");
    let cell = engine.new_transaction(request.clone()).await.unwrap();
    engine.relay(&cell, vec![target(1)]).await.unwrap();
    let forwarded = sent_request(&recorder, 1, "INVITE");
    engine
        .receive_response(response_to(&forwarded, 180))
        .await
        .unwrap();
    assert_eq!(recorder.upstream_codes(), vec![100, 180]);

    let outcome = engine.cancel(&cancel_for(&request)).await.unwrap();
    assert!(matches!(outcome, CancelOutcome::Cancelled(ref c) if *c == cell));
    assert!(engine.was_cancelled(&cell));
    assert_eq!(recorder.upstream_codes(), vec![100, 180, 200], "CANCEL answered");

    let cancel = sent_request(&recorder, 1, "CANCEL");
    assert_eq!(cancel.headers("CSeq"), vec!["1 CANCEL"]);
    assert_eq!(cancel.headers("Via")[0], forwarded.headers("Via")[0]);
    assert!(cancel.start_line().starts_with("CANCEL sip:bob@10.0.0.1 "));

    let matched = engine
        .receive_response(response_to(&cancel, 200))
        .await
        .unwrap();
    assert!(matches!(matched, ResponseMatch::Cancel { branch, .. } if branch.index() == 0));
    assert_eq!(recorder.upstream_codes(), vec![100, 180, 200]);

    engine
        .receive_response(response_to(&forwarded, 487))
        .await
        .unwrap();
    assert_eq!(recorder.requests(&hop(1), "ACK").len(), 1);
    assert_eq!(recorder.upstream_codes(), vec![100, 180, 200, 487]);

    let status = engine.status(&cell);
    assert!(status.cancelled);
    assert_eq!(status.code, 487);
    assert_eq!(status.state, TransactionState::Completed);

    let ack = ack_for(&request);
    assert!(matches!(
        engine.lookup_request(&ack).await.unwrap(),
        RequestMatch::Ack(ref c) if *c == cell
    ));
    assert_eq!(engine.status(&cell).state, TransactionState::Confirmed);
}

#[tokio::test(start_paused = true)]
async fn cancel_after_final_changes_nothing() {
    let (engine, recorder) = engine();
    let request = invite("late");
    let cell = engine.new_transaction(request.clone()).await.unwrap();
    engine.relay(&cell, vec![target(1)]).await.unwrap();
    let forwarded = sent_request(&recorder, 1, "INVITE");
    engine
        .receive_response(response_to(&forwarded, 486))
        .await
        .unwrap();

    let outcome = engine.cancel(&cancel_for(&request)).await.unwrap();
    assert!(matches!(outcome, CancelOutcome::AlreadyCompleted(_)));
    assert!(!engine.was_cancelled(&cell));
    assert!(recorder.requests(&hop(1), "CANCEL").is_empty());
    assert_eq!(recorder.upstream_codes(), vec![100, 486, 200]);
    assert_eq!(engine.status(&cell).code, 486);
}

#[tokio::test(start_paused = true)]
async fn cancel_before_any_branch_answers_487() {
    let (engine, recorder) = engine();
    let request = invite("early");
    let cell = engine.new_transaction(request.clone()).await.unwrap();

    engine.cancel(&cancel_for(&request)).await.unwrap();
    assert_eq!(recorder.upstream_codes(), vec![200, 487]);
    assert_eq!(engine.status(&cell).code, 487);

    // Cancelled transactions refuse new branches.
    assert!(engine.relay(&cell, vec![target(1)]).await.is_err());
    assert!(recorder.to(&hop(1)).is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancel_of_silent_branch_times_out_into_487() {
    let (engine, recorder) = engine();
    let request = invite("silent");
    let cell = engine.new_transaction(request.clone()).await.unwrap();
    engine.relay(&cell, vec![target(1)]).await.unwrap();

    engine.cancel(&cancel_for(&request)).await.unwrap();
    assert_eq!(recorder.requests(&hop(1), "CANCEL").len(), 1);
    assert_eq!(recorder.upstream_codes(), vec![100, 200]);

    advance(&engine, Duration::from_secs(29)).await;
    assert_eq!(recorder.upstream_codes(), vec![100, 200]);
    advance(&engine, Duration::from_secs(1)).await;
    assert_eq!(recorder.upstream_codes(), vec![100, 200, 487]);
    assert_eq!(engine.stats().timeouts, 1);
}

#[tokio::test(start_paused = true)]
async fn answer_after_cancel_is_still_relayed() {
    let (engine, recorder) = engine();
    let request = invite("race");
    let cell = engine.new_transaction(request.clone()).await.unwrap();
    engine.relay(&cell, vec![target(1)]).await.unwrap();
    let forwarded = sent_request(&recorder, 1, "INVITE");
    engine
        .receive_response(response_to(&forwarded, 180))
        .await
        .unwrap();
    engine.cancel(&cancel_for(&request)).await.unwrap();

    engine
        .receive_response(response_to(&forwarded, 200))
        .await
        .unwrap();
    assert_eq!(recorder.upstream_codes(), vec![100, 180, 200, 200]);
    assert_eq!(engine.status(&cell).code, 200);
    assert!(recorder.requests(&hop(1), "ACK").is_empty());

    advance(&engine, Duration::from_secs(60)).await;
    assert_eq!(recorder.upstream_codes(), vec![100, 180, 200, 200]);
}

#[tokio::test(start_paused = true)]
async fn cancel_of_udp_branch_is_retransmitted_until_answered() {
    let (engine, recorder) = engine();
    let request = invite("udpcancel");
    let cell = engine.new_transaction(request.clone()).await.unwrap();
    engine.relay(&cell, vec![udp_target(1)]).await.unwrap();
    let forwarded = sent_request(&recorder, 1, "INVITE");
    engine
        .receive_response(response_to(&forwarded, 180))
        .await
        .unwrap();
    engine.cancel(&cancel_for(&request)).await.unwrap();
    assert_eq!(recorder.requests(&hop(1), "CANCEL").len(), 1);

    advance(&engine, Duration::from_millis(500)).await;
    assert_eq!(recorder.requests(&hop(1), "CANCEL").len(), 2);

    let cancel = recorder.requests(&hop(1), "CANCEL").remove(0);
    engine
        .receive_response(response_to(&cancel, 200))
        .await
        .unwrap();
    advance(&engine, Duration::from_secs(4)).await;
    assert_eq!(recorder.requests(&hop(1), "CANCEL").len(), 2);
    assert_eq!(recorder.requests(&hop(1), "INVITE").len(), 1, "INVITE retransmission stopped");
    assert!(engine.was_cancelled(&cell));
}

#[tokio::test(start_paused = true)]
async fn legacy_matching_correlates_cancel_and_ack() {
    let (engine, recorder) =
        engine_with(TmConfig::default().with_match_mode(MatchMode::Legacy));
    let request = invite("legacy");
    let cell = engine.new_transaction(request.clone()).await.unwrap();
    engine.relay(&cell, vec![target(1)]).await.unwrap();
    let forwarded = sent_request(&recorder, 1, "INVITE");
    engine
        .receive_response(response_to(&forwarded, 180))
        .await
        .unwrap();

    let mut stranger = cancel_for(&request);
    stranger
        .headers
        .set("From", "<sip:mallory@example.com>;tag=m1");
    assert!(matches!(
        engine.cancel(&stranger).await,
        Err(TmError::NoMatchingTransaction)
    ));

    // Host case and the default port do not matter.
    let mut cancel = cancel_for(&request);
    cancel.uri = SmolStr::new("sip:bob@EXAMPLE.COM:5060");
    let outcome = engine.cancel(&cancel).await.unwrap();
    assert!(matches!(outcome, CancelOutcome::Cancelled(ref c) if *c == cell));
    assert_eq!(recorder.requests(&hop(1), "CANCEL").len(), 1);

    engine
        .receive_response(response_to(&forwarded, 487))
        .await
        .unwrap();
    assert_eq!(recorder.upstream_codes(), vec![100, 180, 481, 200, 487]);

    let ack = ack_for(&request);
    assert!(engine.check_trans(&ack).await.unwrap());
    assert!(matches!(
        engine.lookup_request(&ack).await.unwrap(),
        RequestMatch::Ack(ref c) if *c == cell
    ));
    assert_eq!(engine.status(&cell).state, TransactionState::Confirmed);
}
