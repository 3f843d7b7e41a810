//! Read-only handlers.
use crate::{
    commons::SignerResult,
    handlers::{Response, SignerContext},
    tokens::{KeyId, TokenId},
};

impl SignerContext {
    pub(super) fn list_tokens(&self) -> SignerResult<Response> {
        let tokens = self.tokens.tokens()?;
        trace!("Listing {} tokens", tokens.len());
        Ok(Response::Tokens { tokens })
    }

    pub(super) fn get_token_info(&self, token_id: &TokenId) -> SignerResult<Response> {
        let token = self.tokens.token(token_id)?;
        Ok(Response::Token { token })
    }

    pub(super) fn get_key_info(&self, key_id: &KeyId) -> SignerResult<Response> {
        let found = self.tokens.find_token_and_key(key_id)?;
        Ok(Response::Key {
            token_id: found.token_id,
            key: found.key,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        commons::{error::ErrorKind, test},
        device::drivers::mock::MockDriverCallCounts,
        handlers::{
            tests::{context, mock_driver, mock_kind},
            Request, Response,
        },
        tokens::{KeyId, TokenId},
    };

    #[test]
    fn lookups() {
        test::test_under_tmp(|d| {
            let counts = Arc::new(MockDriverCallCounts::new());
            let ctx = context(&d, mock_driver(&counts));
            ctx.tokens().ensure_token(test::token("t1", mock_kind())).unwrap();
            ctx.tokens()
                .add_key(&TokenId::from("t1"), test::key("t1", "k1"))
                .unwrap();

            match ctx.handle(Request::ListTokens).unwrap() {
                Response::Tokens { tokens } => {
                    assert_eq!(tokens.len(), 1);
                    assert_eq!(tokens[0].keys().len(), 1);
                }
                other => panic!("unexpected response: {:?}", other),
            }

            match ctx
                .handle(Request::GetKeyInfo {
                    key_id: KeyId::from("k1"),
                })
                .unwrap()
            {
                Response::Key { token_id, key } => {
                    assert_eq!(token_id.as_str(), "t1");
                    assert_eq!(key.id().as_str(), "k1");
                }
                other => panic!("unexpected response: {:?}", other),
            }

            let err = ctx
                .handle(Request::GetTokenInfo {
                    token_id: TokenId::from("t2"),
                })
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotFound);
        })
    }
}
