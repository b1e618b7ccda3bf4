use std::{
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr, UdpSocket},
};

use log::{debug, info};

use thermometer_common::{CaptiveDns, NetError};

const HEADER_LEN: usize = 12;
const MAX_PACKET: usize = 512;
const ANSWER_TTL_SECS: u32 = 60;

const TYPE_A: u16 = 1;
const TYPE_ANY: u16 = 255;
const CLASS_IN: u16 = 1;
const CLASS_ANY: u16 = 255;

const FLAG_RESPONSE: u16 = 0x8000;
const FLAG_AUTHORITATIVE: u16 = 0x0400;
const FLAG_RECURSION_DESIRED: u16 = 0x0100;
const OPCODE_MASK: u16 = 0x7800;
const RCODE_NOT_IMPLEMENTED: u16 = 4;

/// Answers every A query with a single address so that clients joined to the
/// setup network land on the portal.
#[derive(Default)]
pub struct UdpCaptiveDns {
    socket: Option<UdpSocket>,
    answer: Option<Ipv4Addr>,
    buffer: Vec<u8>,
}

impl UdpCaptiveDns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref()?.local_addr().ok()
    }
}

impl CaptiveDns for UdpCaptiveDns {
    fn start(&mut self, port: u16, answer: Ipv4Addr) -> Result<(), NetError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        socket.set_nonblocking(true)?;
        info!(
            "captive dns listening on {} answering {answer}",
            socket.local_addr()?
        );
        self.socket = Some(socket);
        self.answer = Some(answer);
        self.buffer = vec![0; MAX_PACKET];
        Ok(())
    }

    fn process_next_request(&mut self) -> Result<bool, NetError> {
        let (Some(socket), Some(answer)) = (self.socket.as_ref(), self.answer) else {
            return Err(NetError::NotStarted("captive dns"));
        };

        let (len, peer) = match socket.recv_from(&mut self.buffer) {
            Ok(received) => received,
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(false),
            Err(err) => return Err(err.into()),
        };

        match build_reply(&self.buffer[..len], answer) {
            Some(reply) => {
                socket.send_to(&reply, peer)?;
            }
            None => debug!("captive dns ignored {len} byte packet from {peer}"),
        }
        Ok(true)
    }
}

fn read_u16(packet: &[u8], at: usize) -> Option<u16> {
    let bytes = packet.get(at..at + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Offset just past the question's QNAME, or `None` when the name is
/// truncated or uses compression.
fn skip_name(packet: &[u8], mut at: usize) -> Option<usize> {
    loop {
        let len = *packet.get(at)? as usize;
        at += 1;
        match len {
            0 => return Some(at),
            l if l & 0xC0 != 0 => return None,
            l => at += l,
        }
    }
}

fn header(id: u16, flags: u16, questions: u16, answers: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_PACKET);
    for field in [id, flags, questions, answers, 0, 0] {
        out.extend_from_slice(&field.to_be_bytes());
    }
    out
}

pub fn build_reply(query: &[u8], answer: Ipv4Addr) -> Option<Vec<u8>> {
    if query.len() < HEADER_LEN {
        return None;
    }
    let id = read_u16(query, 0)?;
    let flags = read_u16(query, 2)?;
    if flags & FLAG_RESPONSE != 0 {
        return None;
    }

    let reply_flags = FLAG_RESPONSE | FLAG_AUTHORITATIVE | (flags & FLAG_RECURSION_DESIRED);
    if flags & OPCODE_MASK != 0 || read_u16(query, 4)? != 1 {
        return Some(header(
            id,
            reply_flags | (flags & OPCODE_MASK) | RCODE_NOT_IMPLEMENTED,
            0,
            0,
        ));
    }

    let name_end = skip_name(query, HEADER_LEN)?;
    let qtype = read_u16(query, name_end)?;
    let qclass = read_u16(query, name_end + 2)?;
    let question_end = name_end + 4;

    let answers_a = matches!(qtype, TYPE_A | TYPE_ANY) && matches!(qclass, CLASS_IN | CLASS_ANY);
    let mut reply = header(id, reply_flags, 1, u16::from(answers_a));
    reply.extend_from_slice(&query[HEADER_LEN..question_end]);

    if answers_a {
        // Name is a pointer back to the question.
        reply.extend_from_slice(&[0xC0, HEADER_LEN as u8]);
        reply.extend_from_slice(&TYPE_A.to_be_bytes());
        reply.extend_from_slice(&CLASS_IN.to_be_bytes());
        reply.extend_from_slice(&ANSWER_TTL_SECS.to_be_bytes());
        reply.extend_from_slice(&4_u16.to_be_bytes());
        reply.extend_from_slice(&answer.octets());
    }
    Some(reply)
}
