#![deny(unsafe_code)]

use std::time::Duration;

use structopt::StructOpt;

use ebus::conf::{Options, Settings};
use ebus::logger::logger_init;
use ebus::utils::parse_duration;
use ebus::{fatal, BusClient, CancellationToken, Delivery, PublishPolicy, Registry};

#[derive(StructOpt, Debug)]
#[structopt(name = "ebus", about = "Encrypted, topic-routed message bus client")]
struct Args {
    #[structopt(flatten)]
    opts: Options,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(StructOpt, Debug)]
enum Command {
    /// Encrypts and publishes one message
    Publish {
        /// Routing key
        #[structopt(short, long)]
        topic: String,

        /// Plaintext body
        #[structopt(short, long)]
        message: String,

        /// Maximum publish attempts
        #[structopt(long, default_value = "1")]
        retries: u32,

        /// Delay after a failed attempt, e.g. 500ms, 2s
        #[structopt(long, default_value = "1s", parse(try_from_str = parse_duration))]
        delay: Duration,
    },

    /// Logs every decrypted delivery of the given topics until ctrl-c
    Listen {
        /// Topic to subscribe, repeatable
        #[structopt(short = "t", long = "topic", required = true)]
        topics: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::from_args();

    //init config
    let settings = Settings::init(args.opts.clone()).expect("settings init failed");

    //init log
    logger_init(&settings.log).expect("logger init failed");
    settings.logs();

    let client = BusClient::connect_or_exit(settings.bus.clone()).await;

    let res = match args.cmd {
        Command::Publish { topic, message, retries, delay } => {
            publish(&client, &topic, message.as_bytes(), PublishPolicy::new(retries, delay)).await
        }
        Command::Listen { topics } => listen(&client, topics).await,
    };

    if let Err(e) = res {
        fatal::exit(e);
    }
    ebus::logger::flush();
}

async fn publish(client: &BusClient, topic: &str, message: &[u8], policy: PublishPolicy) -> ebus::Result<()> {
    let receipt = client.try_publish(&CancellationToken::new(), topic, message, Some(policy)).await;
    client.close().await?;
    let receipt = receipt?;
    log::info!("published message {} after {} attempt(s)", receipt.id, receipt.attempts);
    Ok(())
}

async fn listen(client: &BusClient, topics: Vec<String>) -> ebus::Result<()> {
    let registry = topics.into_iter().fold(Registry::new(), |r, topic| r.register(topic, print_delivery));
    client.listen(registry).await?;
    log::info!("listening, press ctrl-c to exit");

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("ctrl-c signal error, {e}");
    }

    client.close().await?;
    log::info!("stats: {:?}", client.stats());
    Ok(())
}

async fn print_delivery(d: Delivery) -> anyhow::Result<()> {
    log::info!("[{}] [{}] {}", d.topic, d.id_or_default(), String::from_utf8_lossy(&d.body));
    Ok(())
}
