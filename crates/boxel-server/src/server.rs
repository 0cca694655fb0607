// server.rs — connection multiplexing and the main loop
//
// The server is single-threaded and event-driven: one poll call per loop
// iteration, bounded by the time until the next scheduled simulation
// event. All state mutation happens on this one control path.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use tracing::{error, info, warn};

use boxel_common::blocks::{self, Block};
use boxel_common::clock::{TimeDelta, WallTime};
use boxel_common::gzip::gzip_compress;
use boxel_common::protocol::{msg_len, MsgBuf, MsgReader, MsgType, ARRAY_LEN, MAX_MESSAGE};

use crate::config::ServerConfig;
use crate::events::{Event, EventKind, EventQueue};
use crate::hooks::{self, ChatReply, Engine};
use crate::level::{Level, Player, Vec3f};

pub const MAX_CLIENTS: usize = 32;

const LISTENER: Token = Token(MAX_CLIENTS);

const RECV_BUF_SIZE: usize = 4096;
const OUT_BUF_SIZE: usize = 4096;
const EVENTS_CAPACITY: usize = 128;

/// One pending chunk of output for a client. `pos` tracks how much of it
/// has already been sent.
struct OutBuf {
    data: Vec<u8>,
    pos: usize,
}

struct Client {
    stream: TcpStream,
    /// Set once the world has been transmitted; only loaded clients
    /// receive broadcasts.
    loaded: bool,
    recv: [u8; RECV_BUF_SIZE],
    recv_len: usize,
    output: VecDeque<OutBuf>,
    writable_registered: bool,
    player: Player,
}

impl Client {
    fn new(stream: TcpStream) -> Client {
        Client {
            stream,
            loaded: false,
            recv: [0; RECV_BUF_SIZE],
            recv_len: 0,
            output: VecDeque::new(),
            writable_registered: false,
            player: Player::default(),
        }
    }
}

/// Appends bytes to a client's output queue. The tail buffer takes them
/// if it has room; otherwise a new buffer of at least `OUT_BUF_SIZE`
/// bytes is linked on.
fn append_output(output: &mut VecDeque<OutBuf>, bytes: &[u8]) {
    let mut rest = bytes;
    if let Some(tail) = output.back_mut() {
        if tail.data.capacity() - tail.data.len() >= rest.len() {
            tail.data.extend_from_slice(rest);
            rest = &[];
        }
    }
    if !rest.is_empty() {
        let mut data = Vec::with_capacity(OUT_BUF_SIZE.max(rest.len()));
        data.extend_from_slice(rest);
        output.push_back(OutBuf { data, pos: 0 });
    }
}

fn encode_pos(v: f32) -> u16 {
    (32.0 * v) as i32 as u16
}

fn encode_yaw(yaw: f32) -> u8 {
    (255.0 * yaw) as i32 as u8
}

fn encode_pitch(pitch: f32) -> u8 {
    (64.0 * pitch) as i32 as u8
}

pub struct Server {
    config: ServerConfig,
    level: Level,
    events: EventQueue,
    poll: Poll,
    listener: TcpListener,
    clients: [Option<Client>; MAX_CLIENTS],
    shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn new(config: ServerConfig, shutdown: Arc<AtomicBool>) -> Result<Server> {
        let level = Level::load(&config.level_path)
            .with_context(|| format!("couldn't load level from {}", config.level_path.display()))?;

        let mut events = EventQueue::new();
        match events.read(&config.event_path) {
            Ok(()) => info!("restored {} pending events", events.count()),
            Err(e) => warn!("couldn't restore event queue: {e:#}"),
        }

        let poll = Poll::new().context("couldn't create I/O poller")?;
        let mut listener = TcpListener::bind(config.bind_addr)
            .with_context(|| format!("couldn't bind server socket to {}", config.bind_addr))?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .context("couldn't register server socket")?;
        info!("listening on {}", config.bind_addr);

        Ok(Server {
            config,
            level,
            events,
            poll,
            listener,
            clients: std::array::from_fn(|_| None),
            shutdown,
        })
    }

    /// Runs the main loop until a shutdown signal arrives, then persists
    /// dirty state.
    pub fn run(&mut self) -> Result<()> {
        let now = WallTime::now();
        self.events.push(Event {
            time: now + self.config.frame_interval,
            kind: EventKind::Tick,
        });
        self.events.push(Event {
            time: now + self.config.save_interval,
            kind: EventKind::Save,
        });

        let mut mio_events = Events::with_capacity(EVENTS_CAPACITY);
        while !self.shutdown.load(Ordering::Relaxed) {
            let next_time = match self.events.peek() {
                Some(event) => event.time,
                None => WallTime::now() + self.config.frame_interval,
            };

            let now = WallTime::now();
            if now < next_time {
                self.poll_io(&mut mio_events, (next_time - now).to_duration())?;
                continue;
            }

            if let Some(event) = self.events.pop() {
                self.dispatch_event(event);
            }
        }

        info!("shutting down");
        self.persist();
        Ok(())
    }

    fn poll_io(&mut self, mio_events: &mut Events, timeout: Duration) -> Result<()> {
        match self.poll.poll(mio_events, Some(timeout)) {
            Ok(()) => {}
            // A signal may interrupt the wait; the main loop re-checks the
            // shutdown flag.
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e).context("I/O poll failed"),
        }

        for event in mio_events.iter() {
            let token = event.token();
            if token == LISTENER {
                self.accept_clients();
            } else if token.0 < MAX_CLIENTS {
                if event.is_writable() {
                    self.handle_writable(token.0);
                }
                if event.is_readable() {
                    self.handle_readable(token.0);
                }
            }
        }
        Ok(())
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    let Some(slot) = self.clients.iter().position(|c| c.is_none()) else {
                        warn!("closing connection from {addr} because server is full");
                        continue;
                    };
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, Token(slot), Interest::READABLE)
                    {
                        error!("failed to register client socket: {e}");
                        continue;
                    }
                    self.clients[slot] = Some(Client::new(stream));
                    info!("accepted connection from {addr} in client slot {slot}");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("couldn't accept connection: {e}");
                    break;
                }
            }
        }
    }

    fn handle_readable(&mut self, slot: usize) {
        loop {
            let result = {
                let Some(cl) = self.clients[slot].as_mut() else { return };
                let len = cl.recv_len;
                cl.stream.read(&mut cl.recv[len..])
            };
            match result {
                Ok(0) => {
                    warn!("read from client {slot} failed");
                    self.disconnect(slot);
                    return;
                }
                Ok(n) => {
                    if let Some(cl) = self.clients[slot].as_mut() {
                        cl.recv_len += n;
                    }
                    if !self.parse_client_data(slot) {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("read from client {slot} failed: {e}");
                    self.disconnect(slot);
                    return;
                }
            }
        }
    }

    /// Consumes as many complete messages as the receive buffer holds;
    /// leftover bytes wait for the next read. Returns false if the client
    /// was disconnected along the way.
    fn parse_client_data(&mut self, slot: usize) -> bool {
        loop {
            let (tag, avail) = match self.clients[slot].as_ref() {
                Some(cl) if cl.recv_len > 0 => (cl.recv[0], cl.recv_len),
                Some(_) => return true,
                None => return false,
            };

            let Some(msg_type) = MsgType::from_u8(tag) else {
                error!("client {slot}: invalid message type {tag}");
                self.disconnect(slot);
                return false;
            };
            let need = msg_len(msg_type);
            if avail < need {
                return true;
            }

            let mut msg = [0u8; MAX_MESSAGE];
            {
                let Some(cl) = self.clients[slot].as_mut() else { return false };
                msg[..need].copy_from_slice(&cl.recv[..need]);
                cl.recv.copy_within(need..cl.recv_len, 0);
                cl.recv_len -= need;
            }
            self.dispatch_message(slot, msg_type, &msg[1..need]);
            if self.clients[slot].is_none() {
                return false;
            }
        }
    }

    fn dispatch_message(&mut self, slot: usize, msg_type: MsgType, payload: &[u8]) {
        let mut reader = MsgReader::new(payload);
        match msg_type {
            MsgType::Helo => {
                let proto = reader.get_byte();
                let name = reader.get_text();
                let _key = reader.get_text();
                let trailer = reader.get_byte();
                self.handle_helo(slot, proto, &name, trailer);
            }
            MsgType::Modr => {
                let x = reader.get_short() as i32;
                let y = reader.get_short() as i32;
                let z = reader.get_short() as i32;
                let action = reader.get_byte();
                let block = reader.get_byte();
                self.handle_modr(slot, x, y, z, action, block);
            }
            MsgType::Plyu => {
                let _id = reader.get_byte();
                let x = reader.get_short();
                let y = reader.get_short();
                let z = reader.get_short();
                let yaw = reader.get_byte();
                let pitch = reader.get_byte();
                self.handle_plyu(slot, x, y, z, yaw, pitch);
            }
            MsgType::Chat => {
                let _id = reader.get_byte();
                let text = reader.get_text();
                self.handle_chat(slot, &text);
            }
            other => {
                warn!("client {slot}: message with type {} ignored", other as u8);
            }
        }
    }

    fn handle_helo(&mut self, slot: usize, proto: u8, name: &str, trailer: u8) {
        {
            let Some(cl) = self.clients[slot].as_mut() else { return };
            if cl.loaded {
                error!("client {slot} already identified");
                return;
            }
            cl.player.name = name.to_owned();
            cl.player.pos = Vec3f {
                x: self.level.spawn.x as f32,
                y: self.level.spawn.y as f32,
                z: self.level.spawn.z as f32,
            };
            cl.player.yaw = self.level.rot_spawn;
            cl.player.pitch = 0.0;
        }

        let mut msg = MsgBuf::new(MsgType::Helo);
        msg.put_byte(proto)
            .put_text(&self.level.name)
            .put_text(&self.level.creator)
            .put_byte(trailer);
        self.write_client(slot, msg.finish());

        self.write_client(slot, MsgBuf::new(MsgType::Strt).finish());
        self.send_world_data(slot);

        let mut msg = MsgBuf::new(MsgType::Size);
        msg.put_short(self.level.size.x as u16)
            .put_short(self.level.size.y as u16)
            .put_short(self.level.size.z as u16);
        self.write_client(slot, msg.finish());

        // Announce the new player's own spawn to it, then exchange
        // announcements with everyone already in the world.
        self.send_player_announce(slot, slot);
        for other in 0..MAX_CLIENTS {
            if other != slot && self.clients[other].as_ref().is_some_and(|c| c.loaded) {
                self.send_player_announce(slot, other);
                self.send_player_announce(other, slot);
            }
        }

        if let Some(cl) = self.clients[slot].as_mut() {
            cl.loaded = true;
        }
        info!("client {slot} hailed with name `{name}`");
    }

    /// Sends the gzipped world payload as a sequence of fixed-size data
    /// chunks, each carrying its actual length and a progress percentage.
    fn send_world_data(&mut self, slot: usize) {
        let data = match gzip_compress(&self.level.encode()) {
            Ok(data) => data,
            Err(e) => {
                error!("couldn't compress world data: {e}");
                return;
            }
        };

        let total = data.len();
        for (i, chunk) in data.chunks(ARRAY_LEN).enumerate() {
            let done = i * ARRAY_LEN + chunk.len();
            let percent = (100 * done / total) as u8;
            let mut msg = MsgBuf::new(MsgType::Data);
            msg.put_short(chunk.len() as u16)
                .put_array(chunk)
                .put_byte(percent);
            self.write_client(slot, msg.finish());
        }
    }

    fn send_player_announce(&mut self, dest: usize, subj: usize) {
        let Some(subj_cl) = self.clients[subj].as_ref() else { return };
        let p = &subj_cl.player;
        let id = if dest == subj { 255 } else { subj as u8 };

        let mut msg = MsgBuf::new(MsgType::Plyc);
        msg.put_byte(id)
            .put_text(&p.name)
            .put_short(encode_pos(p.pos.x))
            .put_short(encode_pos(p.pos.y))
            .put_short(encode_pos(p.pos.z))
            .put_byte(encode_yaw(p.yaw))
            .put_byte(encode_pitch(p.pitch));
        self.write_client(dest, msg.finish());
    }

    fn send_player_update(&mut self, dest: usize, subj: usize) {
        let Some(subj_cl) = self.clients[subj].as_ref() else { return };
        let p = &subj_cl.player;
        let id = if dest == subj { 255 } else { subj as u8 };

        let mut msg = MsgBuf::new(MsgType::Plyu);
        msg.put_byte(id)
            .put_short(encode_pos(p.pos.x))
            .put_short(encode_pos(p.pos.y))
            .put_short(encode_pos(p.pos.z))
            .put_byte(encode_yaw(p.yaw))
            .put_byte(encode_pitch(p.pitch));
        self.write_client(dest, msg.finish());
    }

    fn handle_modr(&mut self, slot: usize, x: i32, y: i32, z: i32, action: u8, block: Block) {
        if !self.level.index_valid(x, y, z) || action > 1 {
            warn!("client {slot}: bad modification request at ({x},{y},{z})");
            return;
        }
        let new_t = if action == 0 { blocks::EMPTY } else { block };
        let old_t = self.level.get(x, y, z);

        let verdict = match self.clients[slot].as_ref() {
            Some(cl) => hooks::authorize_update(&self.level, &cl.player, x, y, z, old_t, new_t),
            None => return,
        };

        match verdict {
            Some(t) => self.update_block(x, y, z, t, TimeDelta::ZERO),
            None => {
                // Denied; re-announce the current type so the client's
                // optimistic local change is reverted.
                let current = hooks::client_block_type(self.level.get(x, y, z));
                let mut msg = MsgBuf::new(MsgType::Modn);
                msg.put_short(x as u16)
                    .put_short(y as u16)
                    .put_short(z as u16)
                    .put_byte(current);
                self.broadcast(msg.finish());
            }
        }
    }

    fn handle_plyu(&mut self, slot: usize, x: u16, y: u16, z: u16, yaw: u8, pitch: u8) {
        let size = self.level.size;
        let Some(cl) = self.clients[slot].as_mut() else { return };
        cl.player.pos.x = (x as f32 / 32.0).clamp(0.0, size.x as f32);
        cl.player.pos.y = (y as f32 / 32.0).clamp(0.0, size.y as f32);
        cl.player.pos.z = (z as f32 / 32.0).clamp(0.0, size.z as f32);
        cl.player.yaw = (yaw as f32 / 255.0).clamp(0.0, 1.0);
        cl.player.pitch = (pitch as i8 as f32 / 64.0).clamp(-1.0, 1.0);
    }

    fn handle_chat(&mut self, slot: usize, text: &str) {
        let reply = match self.clients[slot].as_mut() {
            Some(cl) => hooks::on_chat(&mut cl.player, text),
            None => return,
        };
        match reply {
            ChatReply::None => {}
            ChatReply::Private(s) => {
                let mut msg = MsgBuf::new(MsgType::Chat);
                msg.put_byte(255).put_text(&s);
                self.write_client(slot, msg.finish());
            }
            ChatReply::Broadcast(s) => {
                let mut msg = MsgBuf::new(MsgType::Chat);
                msg.put_byte(slot as u8).put_text(&s);
                self.broadcast(msg.finish());
            }
        }
    }

    /// Applies one block change: writes the level, notifies clients when
    /// the visible type changed, and either runs the rule engine now or
    /// schedules it.
    fn update_block(&mut self, x: i32, y: i32, z: i32, new_t: Block, delay: TimeDelta) {
        let old_t = self.level.set(x, y, z, new_t);

        if hooks::client_block_type(old_t) != hooks::client_block_type(new_t) {
            let mut msg = MsgBuf::new(MsgType::Modn);
            msg.put_short(x as u16)
                .put_short(y as u16)
                .put_short(z as u16)
                .put_byte(hooks::client_block_type(new_t));
            self.broadcast(msg.finish());
        }

        let event = Event {
            time: WallTime::now() + delay,
            kind: EventKind::Update { x, y, z, old_t, new_t },
        };
        if delay.is_zero() {
            hooks::on_event(self, &event);
        } else {
            self.events.push(event);
        }
    }

    fn dispatch_event(&mut self, event: Event) {
        match event.kind {
            EventKind::Tick => self.on_tick(event.time),
            EventKind::Save => self.on_save(),
            _ => hooks::on_event(self, &event),
        }
    }

    fn on_tick(&mut self, scheduled: WallTime) {
        self.level.tick();

        let loaded: Vec<usize> = (0..MAX_CLIENTS)
            .filter(|&i| self.clients[i].as_ref().is_some_and(|c| c.loaded))
            .collect();
        for &dest in &loaded {
            for &subj in &loaded {
                if dest != subj {
                    self.send_player_update(dest, subj);
                }
            }
        }
        self.broadcast(MsgBuf::new(MsgType::Tick).finish());

        // Keep the frame cadence; when more than a frame behind, restart
        // it from now and note the lag.
        let now = WallTime::now();
        let mut next = scheduled + self.config.frame_interval;
        if next <= now {
            let lag = now - next;
            warn!("tick deadline missed; running {}.{:06}s behind", lag.sec, lag.usec);
            next = now + self.config.frame_interval;
        }
        self.events.push(Event {
            time: next,
            kind: EventKind::Tick,
        });
    }

    fn on_save(&mut self) {
        self.save_level_if_dirty();
        if self.events.is_dirty() {
            if let Err(e) = self.events.write(&self.config.event_path) {
                error!("event log save failed: {e:#}");
            }
        }
        self.events.push(Event {
            time: WallTime::now() + self.config.save_interval,
            kind: EventKind::Save,
        });
    }

    fn save_level_if_dirty(&mut self) {
        if self.level.is_dirty() {
            info!("saving level...");
            if let Err(e) = self.level.save(&self.config.level_path) {
                error!("level save failed: {e:#}");
            }
        }
    }

    /// Final flush on shutdown.
    fn persist(&mut self) {
        self.save_level_if_dirty();
        if self.events.is_dirty() {
            info!("saving event queue...");
            if let Err(e) = self.events.write(&self.config.event_path) {
                error!("event log save failed: {e:#}");
            }
        }
    }

    /// Queues bytes for one client, sending immediately when nothing is
    /// pending. Failed sends count as zero bytes written; the error
    /// surfaces on the client's next read.
    fn write_client(&mut self, slot: usize, bytes: &[u8]) {
        {
            let Some(cl) = self.clients[slot].as_mut() else { return };
            let mut written = 0;
            if cl.output.is_empty() {
                written = match cl.stream.write(bytes) {
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
                    Err(e) => {
                        error!("write to client {slot} failed: {e}");
                        0
                    }
                };
            }
            if written < bytes.len() {
                append_output(&mut cl.output, &bytes[written..]);
            }
        }
        self.update_interest(slot);
    }

    fn handle_writable(&mut self, slot: usize) {
        {
            let Some(cl) = self.clients[slot].as_mut() else { return };
            while let Some(front) = cl.output.front_mut() {
                match cl.stream.write(&front.data[front.pos..]) {
                    Ok(n) => {
                        front.pos += n;
                        if front.pos < front.data.len() {
                            break;
                        }
                        cl.output.pop_front();
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        error!("write to client {slot} failed: {e}");
                        break;
                    }
                }
            }
        }
        self.update_interest(slot);
    }

    /// Registers for writability only while output is pending.
    fn update_interest(&mut self, slot: usize) {
        let Some(cl) = self.clients[slot].as_mut() else { return };
        let want_writable = !cl.output.is_empty();
        if want_writable == cl.writable_registered {
            return;
        }
        let interest = if want_writable {
            Interest::READABLE.add(Interest::WRITABLE)
        } else {
            Interest::READABLE
        };
        match self.poll.registry().reregister(&mut cl.stream, Token(slot), interest) {
            Ok(()) => cl.writable_registered = want_writable,
            Err(e) => error!("failed to update interest for client {slot}: {e}"),
        }
    }

    /// Sends to every client that has received the world.
    fn broadcast(&mut self, bytes: &[u8]) {
        for slot in 0..MAX_CLIENTS {
            if self.clients[slot].as_ref().is_some_and(|c| c.loaded) {
                self.write_client(slot, bytes);
            }
        }
    }

    fn disconnect(&mut self, slot: usize) {
        let Some(mut cl) = self.clients[slot].take() else { return };
        if let Err(e) = self.poll.registry().deregister(&mut cl.stream) {
            warn!("failed to deregister client {slot}: {e}");
        }
        let loaded = cl.loaded;
        drop(cl);
        info!("disconnected client {slot}");

        if loaded {
            let mut msg = MsgBuf::new(MsgType::Disc);
            msg.put_byte(slot as u8);
            self.broadcast(msg.finish());
        }

        // With nobody connected the world cannot change until the next
        // join, so flush it now.
        if self.clients.iter().all(|c| c.is_none()) {
            self.save_level_if_dirty();
        }
    }
}

impl Engine for Server {
    fn level(&self) -> &Level {
        &self.level
    }

    fn post_event(&mut self, event: Event) {
        self.events.push(event);
    }

    fn update_block(&mut self, x: i32, y: i32, z: i32, new_t: Block, delay: TimeDelta) {
        Server::update_block(self, x, y, z, new_t, delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_output_fills_tail_buffer() {
        let mut output = VecDeque::new();
        append_output(&mut output, &[1u8; 100]);
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].data.capacity(), OUT_BUF_SIZE);

        // Fits in the tail's spare capacity; no new buffer.
        append_output(&mut output, &[2u8; 100]);
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].data.len(), 200);
    }

    #[test]
    fn test_append_output_links_new_buffer_when_full() {
        let mut output = VecDeque::new();
        append_output(&mut output, &[1u8; OUT_BUF_SIZE]);
        append_output(&mut output, &[2u8; 10]);
        assert_eq!(output.len(), 2);
        assert_eq!(output[1].data.len(), 10);
        assert_eq!(output[1].data.capacity(), OUT_BUF_SIZE);
    }

    #[test]
    fn test_append_output_oversized_message() {
        let mut output = VecDeque::new();
        append_output(&mut output, &[3u8; 10_000]);
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].data.len(), 10_000);
        assert!(output[0].data.capacity() >= 10_000);
    }

    #[test]
    fn test_position_encoding() {
        assert_eq!(encode_pos(0.0), 0);
        assert_eq!(encode_pos(128.0), 4096);
        assert_eq!(encode_pos(1.5), 48);
        assert_eq!(encode_yaw(1.0), 255);
        assert_eq!(encode_yaw(0.5), 127);
        assert_eq!(encode_pitch(-1.0), 192); // -64 as an unsigned byte
        assert_eq!(encode_pitch(0.25), 16);
    }
}
