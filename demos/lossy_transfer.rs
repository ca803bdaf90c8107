use std::cell::RefCell;
use std::rc::Rc;
use clap::Parser;
use clap_derive::Parser;
use kcplus::config::KcpConfig;
use kcplus::session::Session;
use kcplus::test_util::lossy_link::LossyLink;
use tracing::{info, Level};

/// Transfers packets between two sessions over a simulated link with loss, duplication and
///  reordering, in simulated time
#[derive(Parser)]
struct Args {
    #[clap(long, default_value_t = 200)]
    packets: usize,

    #[clap(long, default_value_t = 2000)]
    packet_size: usize,

    #[clap(long, default_value_t = 0.1)]
    loss_rate: f64,

    #[clap(long, default_value_t = 0.05)]
    duplicate_rate: f64,

    #[clap(long, default_value_t = 30)]
    max_delay_millis: u32,

    #[clap(long, default_value_t = 1)]
    seed: u64,

    #[clap(long, default_value_t = false)]
    fastest: bool,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

type Outbox = Rc<RefCell<Vec<Vec<u8>>>>;

fn session(config: &KcpConfig) -> anyhow::Result<(Session, Outbox)> {
    let mut session = Session::with_config(1, config)?;
    let outbox: Outbox = Default::default();
    let captured = outbox.clone();
    session.set_output_function(move |frame: &[u8]| captured.borrow_mut().push(frame.to_vec()));
    Ok((session, outbox))
}

fn link(args: &Args, seed: u64) -> LossyLink {
    LossyLink::new(seed)
        .with_loss_rate(args.loss_rate)
        .with_duplicate_rate(args.duplicate_rate)
        .with_max_delay_millis(args.max_delay_millis)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    let config = if args.fastest { KcpConfig::fastest() } else { KcpConfig::default() };
    let (mut sender, sender_out) = session(&config)?;
    let (mut receiver, receiver_out) = session(&config)?;
    let mut forward = link(&args, args.seed);
    let mut backward = link(&args, args.seed.wrapping_add(1));

    for i in 0..args.packets {
        sender.send(&vec![(i % 256) as u8; args.packet_size])?;
    }

    let mut received = 0;
    let mut now = 0u32;
    while received < args.packets {
        sender.update(now)?;
        for frame in sender_out.borrow_mut().drain(..) {
            forward.push(&frame, now);
        }
        for frame in forward.deliver_due(now) {
            receiver.input(&frame)?;
        }

        receiver.update(now)?;
        for frame in receiver_out.borrow_mut().drain(..) {
            backward.push(&frame, now);
        }
        for frame in backward.deliver_due(now) {
            sender.input(&frame)?;
        }

        while let Some(packet) = receiver.receive() {
            anyhow::ensure!(packet.iter().all(|&b| b == (received % 256) as u8), "packet {} arrived corrupted or out of order", received);
            received += 1;
        }

        now += 10;
    }

    info!("transferred {} packets of {} bytes in {} ms of simulated time", received, args.packet_size, now);
    info!("forward link dropped {} and duplicated {} frames", forward.num_dropped(), forward.num_duplicated());
    info!("backward link dropped {} and duplicated {} frames", backward.num_dropped(), backward.num_duplicated());
    info!("link dead: {}", sender.is_dead_link());
    Ok(())
}
