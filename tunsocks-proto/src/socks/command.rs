/// The CMD field of a SOCKS5 request.
///
/// Only the two commands the router issues are represented; BIND is never
/// sent.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Command {
    Connect,
    Associate,
}

impl Command {
    const CONNECT: u8 = 0x01;
    const ASSOCIATE: u8 = 0x03;
}

impl From<Command> for u8 {
    fn from(command: Command) -> Self {
        match command {
            Command::Connect => Command::CONNECT,
            Command::Associate => Command::ASSOCIATE,
        }
    }
}
