//! Smartconfig sender driven to completion and stopped by the token request

mod common;

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use vtrust_lib::smartconfig::{
    InProcessStop, PacketSink, SendOutcome, SmartconfigFrame, SmartconfigPayload, SmartconfigSender,
};

#[derive(Default)]
struct CountingSink {
    broadcasts: usize,
    multicasts: usize,
}

#[async_trait]
impl PacketSink for CountingSink {
    async fn send_broadcast(&mut self, _length: u16) -> io::Result<()> {
        self.broadcasts += 1;
        Ok(())
    }

    async fn send_multicast(&mut self, _group: Ipv4Addr) -> io::Result<()> {
        self.multicasts += 1;
        Ok(())
    }
}

fn frame() -> SmartconfigFrame {
    let payload = SmartconfigPayload::new("vtrust-flash", "flashmeplease", "EU", "12345678", "0101");
    SmartconfigFrame::encode(&payload).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_all_attempts_complete() {
    let frame = frame();
    let (_stop, stop_rx) = InProcessStop::channel();
    let mut sender = SmartconfigSender::new(CountingSink::default());

    let outcome = sender.run(&frame, 2, Duration::from_secs(3), stop_rx).await.unwrap();
    assert_eq!(outcome, SendOutcome::Completed { attempts: 2 });

    let sink = sender.into_sink();
    let per_frame_broadcasts = 40 * frame.broadcast_head().len() + 10 * frame.broadcast_body.len();
    let per_frame_multicasts = 40 * frame.multicast_head.len()
        + 10 * (frame.multicast_head.len() + frame.multicast_body.len());
    assert_eq!(sink.broadcasts, 2 * per_frame_broadcasts);
    assert_eq!(sink.multicasts, 2 * per_frame_multicasts);
}

#[tokio::test(start_paused = true)]
async fn test_token_request_stops_sender() {
    let (stop, stop_rx) = InProcessStop::channel();
    let (service, _publisher) = gateway(Arc::new(stop), Duration::from_secs(10));

    let sender_task = tokio::spawn(async move {
        let mut sender = SmartconfigSender::new(CountingSink::default());
        let outcome = sender.run(&frame(), 10, Duration::from_secs(3), stop_rx).await;
        (outcome, sender.into_sink())
    });

    // Let the first frame get partway out
    tokio::time::sleep(Duration::from_secs(1)).await;
    service.handle(&request("s.gw.token.get", false, DEVICE_ID, b"")).unwrap();

    let (outcome, sink) = sender_task.await.unwrap();
    assert_eq!(outcome.unwrap(), SendOutcome::Stopped { attempts: 0 });
    assert!(sink.broadcasts + sink.multicasts > 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_before_start_sends_nothing() {
    let (stop, stop_rx) = InProcessStop::channel();
    stop.stop();

    let mut sender = SmartconfigSender::new(CountingSink::default());
    let outcome = sender.run(&frame(), 10, Duration::from_secs(3), stop_rx).await.unwrap();
    assert_eq!(outcome, SendOutcome::Stopped { attempts: 0 });
    let sink = sender.into_sink();
    assert_eq!(sink.broadcasts + sink.multicasts, 0);
}
