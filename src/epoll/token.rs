/// An opaque identifier handed back with each `Event`, chosen by the caller
/// at registration time. The Poller (and, above it, the Channel registry)
/// uses the file descriptor itself as the token, so lookup from a ready
/// event back to its owning Channel is a single map access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl From<Token> for usize {
    fn from(token: Token) -> usize {
        token.0
    }
}

impl From<usize> for Token {
    fn from(val: usize) -> Token {
        Token(val)
    }
}
