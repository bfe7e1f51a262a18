use orbita_voice::{ChannelInfo, Config, SessionController, SessionState, UserIdentity};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let config = Config::new().map_err(anyhow::Error::msg)?;
    println!("{} v{}", config.app_name, config.app_version);

    let channel_name = std::env::args().nth(1).unwrap_or_else(|| "General".to_string());
    let channel = ChannelInfo::new(&channel_name.to_lowercase(), &channel_name);
    let user = UserIdentity {
        id: "local".to_string(),
        display_name: std::env::var("USER").unwrap_or_else(|_| "You".to_string()),
        avatar: None,
    };

    let mut controller = SessionController::from_config(config);
    let mut handle = controller.join(channel, user.clone()).await?;
    let mut state_rx = handle.subscribe_state();
    let mut speakers_rx = handle.subscribe_speakers();

    println!("Joined #{}. Commands: mute | unmute | leave | switch <name>", channel_name);
    if handle.state() == SessionState::Simulated {
        println!("Simulation mode: no audio is captured or played.");
    }

    // 标准输入作为简易控制台
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            // 监听 Ctrl+C 信号
            _ = signal::ctrl_c() => {
                println!("Received Ctrl+C, leaving...");
                break;
            }

            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let mut words = line.split_whitespace();
                match (words.next(), words.next()) {
                    (Some(cmd @ ("mute" | "unmute")), _) => {
                        if let Err(e) = controller.set_muted(&handle, cmd == "mute") {
                            eprintln!("{}", e);
                        }
                    }
                    (Some("leave"), _) => break,
                    (Some("switch"), Some(name)) => {
                        let next = ChannelInfo::new(&name.to_lowercase(), name);
                        match controller.switch_channel(next, user.clone()).await {
                            Ok(h) => {
                                handle = h;
                                state_rx = handle.subscribe_state();
                                speakers_rx = handle.subscribe_speakers();
                                println!("Switched to #{}", name);
                            }
                            Err(e) => eprintln!("Switch failed: {}", e),
                        }
                    }
                    (Some(other), _) => println!("Unknown command: {}", other),
                    (None, _) => {}
                }
            }

            Ok(()) = state_rx.changed() => {
                let state = *state_rx.borrow_and_update();
                println!("State: {:?}", state);
                if state.is_terminal() {
                    println!("Session ended. Type 'switch <name>' to join again, or 'leave'.");
                }
            }

            Ok(()) = speakers_rx.changed() => {
                let speakers = speakers_rx.borrow_and_update().clone();
                if speakers.is_empty() {
                    println!("Speaking: -");
                } else {
                    let names: Vec<_> = speakers.into_iter().collect();
                    println!("Speaking: {}", names.join(", "));
                }
            }
        }
    }

    controller.leave(&handle).await;
    println!("Left #{}. State: {:?}", handle.channel().name, handle.state());
    Ok(())
}
