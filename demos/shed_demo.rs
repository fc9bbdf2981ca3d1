use flow_x::{Backend, Code, FlowConfig, FlowControl, Shedder};
use std::net::SocketAddr;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = FlowConfig::from_toml(
        r#"
        [shed]
        window_ms = 5000
        buckets = 50
        cpu_threshold = 800
        debug = true
        "#,
    )?;

    let flow: FlowControl<SocketAddr> = FlowControl::new(&config)?;
    let _sampler = flow.start_cpu_sampling(&config)?;

    let replicas: Vec<Backend<SocketAddr>> = ["127.0.0.1:9001", "127.0.0.1:9002", "127.0.0.1:9003"]
        .iter()
        .map(|addr| -> Result<_, std::net::AddrParseError> { Ok(Backend::new(*addr, addr.parse()?)) })
        .collect::<Result<_, _>>()?;
    flow.balancer.update(replicas);

    let shedder = flow.shedders.get("/demo.Echo/Say");
    for i in 0..200u32 {
        let promise = match shedder.allow() {
            Ok(promise) => promise,
            Err(e) => {
                println!("request {} rejected: {}", i, e);
                continue;
            }
        };

        let pick = flow.balancer.pick()?;
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Every 17th call to the third replica times out.
        if pick.addr.ends_with("9003") && i % 17 == 0 {
            pick.done.finish(Err(Code::DeadlineExceeded));
            promise.fail();
        } else {
            pick.done.finish(Ok(()));
            promise.pass();
        }
    }

    println!("shedder: {}", serde_json::to_string(&shedder.stat())?);
    for node in flow.balancer.stats() {
        println!("{:?}", node);
    }
    Ok(())
}
