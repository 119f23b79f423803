use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;

use actor_api::{Actor, ActorContext, ActorResult, Ports, Setup};
use link_api::{LinkBroker, LinkSpec, Signal};
use store_api::{unlink_region, ShmStore, StoreClient};

struct Counting {
    steps: u32,
    fail_setup: bool,
}

#[async_trait(?Send)]
impl Actor for Counting {
    async fn setup(&mut self, _context: &mut ActorContext) -> ActorResult<()> {
        if self.fail_setup {
            return Setup {
                message: "no device",
            }
            .fail();
        }
        Ok(())
    }

    async fn run_step(&mut self, _context: &mut ActorContext) -> ActorResult<()> {
        self.steps += 1;
        tokio::time::sleep(Duration::from_millis(1)).await;
        Ok(())
    }

    async fn stop(&mut self, context: &mut ActorContext) -> ActorResult<()> {
        context.report(format!("steps: {}", self.steps)).await
    }
}

struct Rig {
    signals: link_api::LinkSender,
    comm: link_api::LinkReceiver,
    region: String,
}

fn rig(test: &str, fail_setup: bool) -> (Rig, tokio::task::JoinHandle<ActorResult<()>>) {
    let broker = LinkBroker::new();
    broker
        .register(LinkSpec::simple("T_sig", "nexus", "T", 16))
        .unwrap();
    broker
        .register(LinkSpec::simple("T_comm", "T", "nexus", 16))
        .unwrap();

    let region = format!("/actor-api-{}-{}", test, std::process::id());
    let store = StoreClient::Arena(ShmStore::create(&region, 1024 * 1024).unwrap());

    let mut context = ActorContext {
        name: "T".to_string(),
        options: serde_json::Value::Null,
        store,
        ports: Ports::default(),
        signals: broker.local_receiver("T_sig", "T").unwrap(),
        comm: broker.local_sender("T_comm").unwrap(),
    };

    let handle = tokio::task::spawn_local(async move {
        let mut actor = Counting {
            steps: 0,
            fail_setup,
        };
        actor.run(&mut context).await
    });

    let rig = Rig {
        signals: broker.local_sender("T_sig").unwrap(),
        comm: broker.local_receiver("T_comm", "nexus").unwrap(),
        region,
    };
    (rig, handle)
}

#[tokio::test]
async fn driver_walks_the_lifecycle() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let (mut rig, handle) = rig("lifecycle", false);

            rig.signals.put_obj(&Signal::Setup).await.unwrap();
            let reply: Signal = rig.comm.get_obj().await.unwrap();
            assert_eq!(reply, Signal::Ready);

            rig.signals.put_obj(&Signal::Run).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;

            rig.signals.put_obj(&Signal::Stop).await.unwrap();
            let status: Signal = rig.comm.get_obj().await.unwrap();
            assert_matches!(status, Signal::Status(message) if message.starts_with("steps: "));
            let reply: Signal = rig.comm.get_obj().await.unwrap();
            assert_eq!(reply, Signal::StopSuccess);

            // a stopped actor can be revived
            rig.signals.put_obj(&Signal::Setup).await.unwrap();
            let reply: Signal = rig.comm.get_obj().await.unwrap();
            assert_eq!(reply, Signal::Ready);

            rig.signals.put_obj(&Signal::Quit).await.unwrap();
            handle.await.unwrap().unwrap();

            unlink_region(&rig.region).unwrap();
        })
        .await;
}

#[tokio::test]
async fn setup_failure_blocks_ready() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let (mut rig, handle) = rig("setup-failure", true);

            rig.signals.put_obj(&Signal::Setup).await.unwrap();
            let reply: Signal = rig.comm.get_obj().await.unwrap();
            assert_matches!(reply, Signal::Status(message) if message.contains("setup failed"));

            // run is answered with a refusal, not silence
            rig.signals.put_obj(&Signal::Run).await.unwrap();
            let reply: Signal = rig.comm.get_obj().await.unwrap();
            assert_matches!(reply, Signal::Status(message) if message.contains("run refused"));

            rig.signals.put_obj(&Signal::Quit).await.unwrap();
            handle.await.unwrap().unwrap();

            unlink_region(&rig.region).unwrap();
        })
        .await;
}
