mod msghdr;

pub(crate) use msghdr::RecvHeader;
