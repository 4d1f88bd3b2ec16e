use crate::api::session::StartSessionRequest;
use crate::chat::ChatMessage;
use crate::entity::UserId;
use crate::notification::Banner;
use crate::realtime::RealtimeError;
use crate::room::{ChatRoom, SessionState, StartOutcome};
use crate::settlement::{AttendanceSheet, Settlement};
use anyhow::{anyhow, bail, Context};
use chrono::{NaiveDate, NaiveTime};
use futures::StreamExt;
use std::future::Future;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::watch;
use tracing::{error, info};

const HELP: &str = "\
Commands:
  /help                              show this text
  /participants                      list participants and payment status
  /older                             load the previous page of history
  /start <date> <HH:MM> <price> <location>
                                     start a round (owner)
  /end                               take attendance for the active round (owner)
  /attend <userId>                   toggle a participant's attendance
  /settle                            refund attendees and end the round; re-run to resume
  /retry                             resend the last unsent message
  /quit                              leave the room
Anything else is sent as a chat message.";

#[derive(Debug, Clone, PartialEq, Eq)]
enum ChatCommand {
    Help,
    Participants,
    Older,
    Start(StartSessionRequest),
    End,
    Attend(UserId),
    Settle,
    Retry,
    Quit,
    Say(String),
}

impl ChatCommand {
    fn parse(line: &str) -> anyhow::Result<Self> {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(ChatCommand::Say(line.to_string()));
        };
        let mut words = rest.split_whitespace();
        let name = words.next().unwrap_or_default();

        let command = match name {
            "help" => ChatCommand::Help,
            "participants" => ChatCommand::Participants,
            "older" => ChatCommand::Older,
            "end" => ChatCommand::End,
            "settle" => ChatCommand::Settle,
            "retry" => ChatCommand::Retry,
            "quit" => ChatCommand::Quit,
            "attend" => {
                let user = words.next().context("usage: /attend <userId>")?;
                ChatCommand::Attend(user.parse().with_context(|| format!("bad user id {user}"))?)
            }
            "start" => {
                let usage = "usage: /start <YYYY-MM-DD> <HH:MM> <price> <location>";
                let date = words.next().context(usage)?;
                let time = words.next().context(usage)?;
                let price = words.next().context(usage)?;
                let location = words.collect::<Vec<_>>().join(" ");
                if location.is_empty() {
                    bail!(usage);
                }
                ChatCommand::Start(StartSessionRequest {
                    date: NaiveDate::parse_from_str(date, "%Y-%m-%d")
                        .with_context(|| format!("bad date {date}"))?,
                    time: NaiveTime::parse_from_str(time, "%H:%M")
                        .with_context(|| format!("bad time {time}"))?,
                    price: price.parse().with_context(|| format!("bad price {price}"))?,
                    location,
                })
            }
            other => return Err(anyhow!("unknown command /{other}, try /help")),
        };
        Ok(command)
    }
}

/// Line-oriented front-end for one chat room.
pub struct TerminalChat {
    room: ChatRoom,
    banners: Option<watch::Receiver<Option<Banner>>>,
    sheet: Option<AttendanceSheet>,
    settlement: Option<Settlement>,
    unsent: Option<String>,
}

impl TerminalChat {
    pub fn new(room: ChatRoom, banners: Option<watch::Receiver<Option<Banner>>>) -> Self {
        Self {
            room,
            banners,
            sheet: None,
            settlement: None,
            unsent: None,
        }
    }

    /// Reads commands from `input` until `/quit`, end of input or `shutdown`.
    /// Always leaves the room and disconnects the transport before returning.
    pub async fn run_until<R, S>(mut self, input: R, shutdown: S) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        S: Future,
    {
        let result = tokio::select! {
            result = self.session(input) => result,
            _ = shutdown => {
                info!("Shutdown requested, leaving room {}", self.room.room_id());
                Ok(())
            }
        };

        self.room.close();
        self.room.realtime().disconnect().await;
        info!("Left room {}", self.room.room_id());
        result
    }

    async fn session<R: AsyncBufRead + Unpin>(&mut self, input: R) -> anyhow::Result<()> {
        println!("Room {} ({:?}). /help for commands.", self.room.room_id(), self.room.role());
        for message in self.room.messages().iter().rev() {
            print_message(message);
        }
        self.print_session();

        let live = self.room.live_messages();
        tokio::pin!(live);
        let mut state = self.room.realtime().watch_state();
        let mut banners = self.banners.take();
        let mut lines = input.lines();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line.context("Failed to read input")? else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match ChatCommand::parse(&line) {
                        Ok(command) => {
                            if !self.handle(command).await {
                                break;
                            }
                        }
                        Err(err) => println!("! {err:#}"),
                    }
                }
                Some(message) = live.next() => print_message(&message),
                changed = state.changed() => {
                    if changed.is_err() {
                        error!("Realtime transport went away");
                        break;
                    }
                    let current = *state.borrow_and_update();
                    println!("* {current}");
                }
                Some(banner) = next_banner(&mut banners) => println!(">> {}", banner.text),
            }
        }
        Ok(())
    }

    /// Returns false when the user asked to leave.
    async fn handle(&mut self, command: ChatCommand) -> bool {
        match command {
            ChatCommand::Help => println!("{HELP}"),
            ChatCommand::Quit => return false,
            ChatCommand::Say(text) => self.say(text).await,
            ChatCommand::Retry => match self.unsent.take() {
                Some(text) => self.say(text).await,
                None => println!("! nothing to resend"),
            },
            ChatCommand::Participants => {
                if let Err(err) = self.room.refresh_participants().await {
                    println!("! {err}");
                }
                for p in self.room.participants() {
                    println!("  {:>6}  {:<16} {}", p.user_id, p.name, p.payment_status.as_str());
                }
            }
            ChatCommand::Older => match self.room.load_older().await {
                Ok(0) => println!("* no older messages"),
                Ok(added) => {
                    println!("* {added} older message(s):");
                    for message in self.room.messages().iter().rev().take(added) {
                        print_message(message);
                    }
                }
                Err(err) => println!("! {err}"),
            },
            ChatCommand::Start(request) => match self.room.start_session(&request).await {
                Ok(StartOutcome::Started(session)) => {
                    println!("* round {} started", session.round_number)
                }
                Ok(StartOutcome::AlreadyActive(session)) => {
                    println!("! round {} is already active", session.round_number)
                }
                Ok(StartOutcome::InFlight) => println!("! a start is already in progress"),
                Err(err) => println!("! {err}"),
            },
            ChatCommand::End => match self.room.end_session().await {
                Ok(sheet) => {
                    print_sheet(&sheet);
                    self.sheet = Some(sheet);
                    self.settlement = None;
                }
                Err(err) => println!("! {err}"),
            },
            ChatCommand::Attend(user) => match self.sheet.as_mut() {
                Some(sheet) => match sheet.toggle(user) {
                    Some(attended) => println!("* user {user} attended: {attended}"),
                    None => println!("! user {user} is not on the sheet"),
                },
                None => println!("! run /end first"),
            },
            ChatCommand::Settle => self.settle().await,
        }
        true
    }

    async fn say(&mut self, text: String) {
        match self.room.send(&text).await {
            Ok(()) => {}
            Err(RealtimeError::NotConnected) => {
                println!("! not connected, message kept; /retry to resend");
                self.unsent = Some(text);
            }
            Err(err) => {
                println!("! send failed: {err}; /retry to resend");
                self.unsent = Some(text);
            }
        }
    }

    async fn settle(&mut self) {
        let mut settlement = match (self.settlement.take(), self.sheet.take()) {
            (Some(settlement), _) => settlement,
            (None, Some(sheet)) => sheet.into_settlement(),
            (None, None) => {
                println!("! run /end first");
                return;
            }
        };

        match settlement.run(self.room.api()).await {
            Ok(report) => {
                println!(
                    "* refunded {} participant(s); session {} ended",
                    report.refunded.len(),
                    settlement.session_id()
                );
                self.room.refresh_session().await;
                self.print_session();
            }
            Err(err) => {
                println!("! {err}");
                println!(
                    "  refunded: {:?}, pending: {:?}; /settle to resume",
                    err.report.refunded, err.report.pending
                );
                self.settlement = Some(settlement);
            }
        }
    }

    fn print_session(&self) {
        match self.room.session_state() {
            SessionState::SessionActive(session) => println!(
                "* round {} active: {} {}",
                session.round_number, session.date, session.time
            ),
            SessionState::NoActiveSession => println!("* no active round"),
        }
    }
}

async fn next_banner(banners: &mut Option<watch::Receiver<Option<Banner>>>) -> Option<Banner> {
    let rx = banners.as_mut()?;
    loop {
        if rx.changed().await.is_err() {
            return None;
        }
        if let Some(banner) = rx.borrow_and_update().clone() {
            return Some(banner);
        }
    }
}

fn print_message(message: &ChatMessage) {
    println!(
        "[{}] {}: {}",
        message.sent_at_time.format("%m-%d %H:%M"),
        message.sender_name,
        message.text
    );
}

fn print_sheet(sheet: &AttendanceSheet) {
    println!("Round {} attendance (toggle with /attend <userId>):", sheet.round_number);
    for entry in sheet.entries() {
        println!(
            "  {:>6}  {:<16} paid: {:<5} attended: {}",
            entry.participant.user_id, entry.participant.name, entry.paid, entry.attended
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_message() {
        assert_eq!(
            ChatCommand::parse("  안녕하세요 ").unwrap(),
            ChatCommand::Say("안녕하세요".into())
        );
    }

    #[test]
    fn parses_start() {
        let command = ChatCommand::parse("/start 2024-05-03 19:00 10000 강남역 2번 출구").unwrap();
        let ChatCommand::Start(request) = command else {
            panic!("expected start");
        };
        assert_eq!(request.price, 10000);
        assert_eq!(request.location, "강남역 2번 출구");
        assert_eq!(request.time, NaiveTime::from_hms_opt(19, 0, 0).unwrap());
    }

    #[test]
    fn rejects_bad_input() {
        assert!(ChatCommand::parse("/start 2024-05-03 19:00 10000").is_err());
        assert!(ChatCommand::parse("/attend mina").is_err());
        assert!(ChatCommand::parse("/dance").is_err());
        assert_eq!(ChatCommand::parse("/attend 3").unwrap(), ChatCommand::Attend(3));
        assert_eq!(ChatCommand::parse("/quit").unwrap(), ChatCommand::Quit);
    }

    #[test]
    fn parses_older() {
        assert_eq!(ChatCommand::parse("/older").unwrap(), ChatCommand::Older);
        assert_eq!(ChatCommand::parse("  /older  ").unwrap(), ChatCommand::Older);
    }
}
