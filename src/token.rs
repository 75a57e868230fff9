/// Associates an endpoint with a readiness event.
///
/// Tokens are allocated by the reactor from a monotonic counter when an
/// endpoint is registered, and map events delivered by the selector back
/// to the registered endpoint. The token itself carries no meaning.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Token(pub usize);

impl From<Token> for usize {
    fn from(val: Token) -> usize {
        val.0
    }
}
