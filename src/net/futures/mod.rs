mod recvfrom;
mod sendto;

pub use recvfrom::RecvFrom;
pub use sendto::SendTo;
