use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use clap::Parser;
use clap_derive::Parser;
use kcplus::clock::{time_diff, Clock, MonotonicClock};
use kcplus::config::KcpConfig;
use kcplus::packet::Packet;
use kcplus::session::Session;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::time::sleep;
use tracing::{info, warn, Level};

/// Two sessions exchanging pings and pongs over UDP sockets on localhost. The pinging side polls
///  for packets, the ponging side is callback driven.
#[derive(Parser)]
struct Args {
    #[clap(long, default_value_t = 42)]
    conv: u32,

    #[clap(short, long, default_value_t = 10)]
    count: usize,

    #[clap(long, default_value_t = false)]
    fastest: bool,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

fn wire_output(session: &mut Session, socket: Arc<UdpSocket>, peer: SocketAddr) {
    session.set_output_function(move |frame: &[u8]| {
        if let Err(e) = socket.try_send_to(frame, peer) {
            warn!("error sending frame to {:?}: {}", peer, e);
        }
    });
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::TRACE } else { Level::INFO })
        .try_init()
        .ok();

    let config = if args.fastest { KcpConfig::fastest() } else { KcpConfig::default() };

    let socket_a = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    let socket_b = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    let addr_a = socket_a.local_addr()?;
    let addr_b = socket_b.local_addr()?;
    info!("pinging from {:?} to {:?}", addr_a, addr_b);

    let mut a = Session::with_config(args.conv, &config)?;
    wire_output(&mut a, socket_a.clone(), addr_b);

    let mut b = Session::with_config(args.conv, &config)?;
    wire_output(&mut b, socket_b.clone(), addr_a);
    let inbox: Rc<RefCell<Vec<Packet>>> = Default::default();
    let b_inbox = inbox.clone();
    b.set_async_mode(true);
    b.set_receive_callback(move |packet| b_inbox.borrow_mut().push(packet));

    let clock = MonotonicClock::new();
    let mut buf_a = vec![0u8; 65536];
    let mut buf_b = vec![0u8; 65536];

    let mut num_pongs = 0;
    let mut ping_sent_at = clock.now_millis();
    a.send(b"ping 0")?;
    a.flush()?;

    while num_pongs < args.count {
        let now = clock.now_millis();
        a.update(now)?;
        b.update(now)?;

        let pings = std::mem::take(&mut *inbox.borrow_mut());
        for ping in pings {
            let text = String::from_utf8_lossy(&ping);
            info!("B received {:?}", text);
            b.send(text.replace("ping", "pong").as_bytes())?;
            b.flush()?;
        }

        while let Some(pong) = a.receive() {
            info!("A received {:?} after {} ms", String::from_utf8_lossy(&pong), time_diff(clock.now_millis(), ping_sent_at));
            num_pongs += 1;
            if num_pongs < args.count {
                ping_sent_at = clock.now_millis();
                a.send(format!("ping {}", num_pongs).as_bytes())?;
                a.flush()?;
            }
        }

        let next_update = time_diff(a.when_to_update(now), now)
            .min(time_diff(b.when_to_update(now), now))
            .max(1);

        select! {
            r = socket_a.recv_from(&mut buf_a) => {
                let (len, _) = r?;
                a.input(&buf_a[..len])?;
            }
            r = socket_b.recv_from(&mut buf_b) => {
                let (len, _) = r?;
                b.input(&buf_b[..len])?;
            }
            _ = sleep(Duration::from_millis(next_update as u64)) => {}
        }
    }

    info!("done: {} round trips, {} segments still pending", num_pongs, a.num_pending_packets());
    Ok(())
}
