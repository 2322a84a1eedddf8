//! Backpressure through the global writer permit pool: writes block when
//! the pool is exhausted and resume as acknowledgements drain.

mod common;

use common::*;
use logship_common::store::StateStore;
use logship_agent::adapter::SinkAdapter;
use logship_agent::memory::AGENT_GLOBAL_WRITER_PERMIT;
use logship_agent::pipeline::SinkPipeline;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[tokio::test]
async fn writes_block_on_exhausted_pool_and_resume_after_ack() {
    let store = new_store();
    let budget = new_budget(200);
    let transport = GateTransport::gated();

    let mut config = fast_pipeline_config();
    // One record per batch, so acknowledgements arrive message by message.
    config.batch_max_records = 1;

    let mut sink = SinkPipeline::new(
        config,
        transport.clone(),
        budget.clone(),
        store.clone() as Arc<dyn StateStore>,
    );
    let profile = instance_profile("t1", "c.log");
    sink.init(&profile).await.unwrap();
    let sink = Arc::new(sink);

    // First two messages fill the pool.
    sink.write(make_message("1", 100)).await;
    sink.write(make_message("2", 100)).await;
    assert_eq!(budget.used(AGENT_GLOBAL_WRITER_PERMIT), 200);

    // The third write must block until a permit frees up.
    let blocked_sink = sink.clone();
    let third = tokio::spawn(async move {
        blocked_sink.write(make_message("3", 100)).await;
    });
    sleep(Duration::from_millis(50)).await;
    assert!(!third.is_finished(), "third write should be blocked");
    assert_eq!(budget.used(AGENT_GLOBAL_WRITER_PERMIT), 200);

    // Ack the first message; its drained permit admits the third write.
    transport.allow(1);
    wait_for("third write unblocked", || third.is_finished()).await;
    assert_eq!(budget.used(AGENT_GLOBAL_WRITER_PERMIT), 200);

    let mut checkpointed = false;
    for _ in 0..1000 {
        let offset = store.get_offset("t1", "c.log").await.unwrap();
        if offset.map(|o| o.offset == "1").unwrap_or(false) {
            checkpointed = true;
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert!(checkpointed, "first offset never checkpointed");

    // Let the rest through and verify the pool drains fully.
    transport.allow(2);
    wait_for("remaining acks drained", || {
        budget.used(AGENT_GLOBAL_WRITER_PERMIT) == 0
    })
    .await;
    assert!(sink.finished().await);

    sink.destroy().await;
    assert_eq!(budget.used(AGENT_GLOBAL_WRITER_PERMIT), 0);
}

fn make_message(offset: &str, len: usize) -> logship_common::types::Message {
    use logship_common::types::{header, Message};
    use std::collections::HashMap;

    let mut headers = HashMap::new();
    headers.insert(header::OFFSET.to_string(), offset.to_string());
    headers.insert(header::STREAM_ID.to_string(), "s1".to_string());
    Message::new(bytes::Bytes::from(vec![b'z'; len]), headers)
}
