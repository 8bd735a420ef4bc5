//! Bridge contract ABI: calldata builders and log decoding

use crate::error::{RelayerError, RelayerResult};
use crate::events::CachedEvent;
use crate::types::{AssetType, ChainCode, Payload};

use ethers::abi::{parse_abi, Abi, RawLog, Token};
use ethers::types::{Address, Bytes, Log, U256};
use serde_json::{Map, Value};
use std::str::FromStr;

const TOKEN_ABI: &[&str] = &[
    "function wrap(address account, uint256 amount, string obtid)",
    "function hasOracleApproved(string obtid, address oracle) view returns (bool)",
    "event wrapped(address account, uint256 amount, string obtid)",
    "event unwrapped(string fioaddress, uint256 amount)",
    "event consensus_activity(string signer, address account, string obtid, uint256 amount)",
];

const NFT_ABI: &[&str] = &[
    "function wrapnft(address account, string domain, string obtid)",
    "function burnnft(uint256 tokenId, string obtid)",
    "function getTokenId(string domain) view returns (uint256)",
    "function hasOracleApproved(string obtid, address oracle) view returns (bool)",
    "event wrapped(address account, string domain, string obtid)",
    "event unwrapped(string fioaddress, string domain)",
    "event consensus_activity(string signer, address account, string obtid, string domain)",
    "event domainburned(uint256 tokenId, string obtid)",
];

/// One deployed bridge contract (fungible or NFT) on one chain
#[derive(Debug, Clone)]
pub struct BridgeContract {
    chain: ChainCode,
    asset: AssetType,
    address: Address,
    abi: Abi,
}

impl BridgeContract {
    pub fn new(chain: ChainCode, asset: AssetType, address: &str) -> RelayerResult<Self> {
        let address = Address::from_str(address)
            .map_err(|e| {
                RelayerError::Config(format!("Invalid contract address {}: {}", address, e))
            })?;
        let abi = match asset {
            AssetType::Tokens => parse_abi(TOKEN_ABI),
            AssetType::Nft => parse_abi(NFT_ABI),
        }
        .map_err(|e| RelayerError::Abi(e.to_string()))?;

        Ok(Self {
            chain,
            asset,
            address,
            abi,
        })
    }

    pub fn chain(&self) -> &ChainCode {
        &self.chain
    }

    pub fn asset(&self) -> AssetType {
        self.asset
    }

    pub fn address(&self) -> Address {
        self.address
    }

    fn encode(&self, function: &str, args: &[Token]) -> RelayerResult<Bytes> {
        let f = self
            .abi
            .function(function)
            .map_err(|e| {
                RelayerError::Abi(format!(
                    "{} on {} {}: {}",
                    function, self.chain, self.asset, e
                ))
            })?;
        f.encode_input(args)
            .map(Bytes::from)
            .map_err(|e| RelayerError::Abi(e.to_string()))
    }

    fn decode(&self, function: &str, output: &[u8]) -> RelayerResult<Vec<Token>> {
        let f = self
            .abi
            .function(function)
            .map_err(|e| RelayerError::Abi(e.to_string()))?;
        f.decode_output(output)
            .map_err(|e| RelayerError::Abi(format!("decoding {} output: {}", function, e)))
    }

    /// Calldata for a wrap of either asset type
    pub fn wrap_calldata(&self, payload: &Payload, obt_id: &str) -> RelayerResult<Bytes> {
        match (self.asset, payload) {
            (AssetType::Tokens, Payload::Tokens { amount, target_address }) => self.encode(
                "wrap",
                &[
                    Token::Address(parse_address(target_address)?),
                    Token::Uint(*amount),
                    Token::String(obt_id.to_string()),
                ],
            ),
            (AssetType::Nft, Payload::Nft { name, target_address }) => self.encode(
                "wrapnft",
                &[
                    Token::Address(parse_address(target_address)?),
                    Token::String(name.clone()),
                    Token::String(obt_id.to_string()),
                ],
            ),
            (asset, payload) => Err(RelayerError::Abi(format!(
                "cannot wrap {:?} on {} contract",
                payload, asset
            ))),
        }
    }

    pub fn burn_calldata(&self, token_id: U256, obt_id: &str) -> RelayerResult<Bytes> {
        self.encode(
            "burnnft",
            &[Token::Uint(token_id), Token::String(obt_id.to_string())],
        )
    }

    pub fn token_id_calldata(&self, domain: &str) -> RelayerResult<Bytes> {
        self.encode("getTokenId", &[Token::String(domain.to_string())])
    }

    pub fn decode_token_id(&self, output: &[u8]) -> RelayerResult<U256> {
        match self.decode("getTokenId", output)?.into_iter().next() {
            Some(Token::Uint(id)) => Ok(id),
            other => Err(RelayerError::Abi(format!("unexpected getTokenId output {:?}", other))),
        }
    }

    pub fn approval_calldata(&self, obt_id: &str, oracle: Address) -> RelayerResult<Bytes> {
        self.encode(
            "hasOracleApproved",
            &[Token::String(obt_id.to_string()), Token::Address(oracle)],
        )
    }

    pub fn decode_approval(&self, output: &[u8]) -> RelayerResult<bool> {
        match self.decode("hasOracleApproved", output)?.into_iter().next() {
            Some(Token::Bool(approved)) => Ok(approved),
            other => Err(RelayerError::Abi(format!(
                "unexpected hasOracleApproved output {:?}",
                other
            ))),
        }
    }

    /// Decode a log emitted by this contract. Unknown topics yield `None`.
    pub fn decode_log(&self, log: &Log, observed_at: i64) -> RelayerResult<Option<CachedEvent>> {
        let Some(topic) = log.topics.first() else {
            return Ok(None);
        };
        let Some(event) = self.abi.events().find(|e| e.signature() == *topic) else {
            return Ok(None);
        };

        let parsed = event
            .parse_log(RawLog {
                topics: log.topics.clone(),
                data: log.data.to_vec(),
            })
            .map_err(|e| {
                RelayerError::EventParsing(format!("{} on {}: {}", event.name, self.chain, e))
            })?;

        let mut values = Map::new();
        for param in parsed.params {
            values.insert(param.name, token_to_json(param.value));
        }

        Ok(Some(CachedEvent {
            event_name: event.name.clone(),
            block_number: log.block_number.map(|b| b.as_u64()).unwrap_or_default(),
            transaction_hash: log
                .transaction_hash
                .map(|h| format!("{:?}", h))
                .unwrap_or_default(),
            log_index: log.log_index.map(|i| i.low_u64()).unwrap_or_default(),
            return_values: values,
            observed_at,
        }))
    }
}

fn parse_address(raw: &str) -> RelayerResult<Address> {
    Address::from_str(raw.trim())
        .map_err(|e| RelayerError::Abi(format!("invalid address {}: {}", raw, e)))
}

fn token_to_json(token: Token) -> Value {
    match token {
        Token::Address(a) => Value::String(format!("{:?}", a)),
        Token::Uint(v) | Token::Int(v) => Value::String(v.to_string()),
        Token::String(s) => Value::String(s),
        Token::Bool(b) => Value::Bool(b),
        Token::Bytes(b) | Token::FixedBytes(b) => Value::String(format!("0x{}", hex::encode(b))),
        Token::Array(items) | Token::FixedArray(items) | Token::Tuple(items) => {
            Value::Array(items.into_iter().map(token_to_json).collect())
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::events::names;
    use ethers::abi::encode;
    use ethers::types::{H256, U64};

    pub(crate) const TOKEN_ADDR: &str = "0x0000000000000000000000000000000000000001";
    pub(crate) const NFT_ADDR: &str = "0x0000000000000000000000000000000000000002";

    /// Build a log for one of the bridge events as a node would return it
    pub(crate) fn bridge_log(
        contract: &BridgeContract,
        event: &str,
        args: Vec<Token>,
        block: u64,
        tx: u64,
    ) -> Log {
        let signature = contract.abi.event(event).unwrap().signature();
        Log {
            address: contract.address(),
            topics: vec![signature],
            data: encode(&args).into(),
            block_number: Some(U64::from(block)),
            transaction_hash: Some(H256::from_low_u64_be(tx)),
            log_index: Some(U256::zero()),
            ..Default::default()
        }
    }

    fn tokens() -> BridgeContract {
        BridgeContract::new(ChainCode::new("POL"), AssetType::Tokens, TOKEN_ADDR).unwrap()
    }

    #[test]
    fn wrap_calldata_uses_selector() {
        let contract = tokens();
        let data = contract
            .wrap_calldata(
                &Payload::Tokens {
                    amount: U256::from(500u64),
                    target_address: "0x00000000000000000000000000000000000000aa".into(),
                },
                "42",
            )
            .unwrap();
        let selector = &ethers::utils::keccak256("wrap(address,uint256,string)")[..4];
        assert_eq!(&data[..4], selector);
    }

    #[test]
    fn nft_payload_is_rejected_by_token_contract() {
        let err = tokens()
            .wrap_calldata(
                &Payload::Nft {
                    name: "dapp".into(),
                    target_address: "0x00000000000000000000000000000000000000aa".into(),
                },
                "42",
            )
            .unwrap_err();
        assert!(matches!(err, RelayerError::Abi(_)));
    }

    #[test]
    fn wrapped_log_is_decoded() {
        let contract = tokens();
        let account: Address = "0x00000000000000000000000000000000000000aa".parse().unwrap();
        let log = bridge_log(
            &contract,
            names::WRAPPED,
            vec![
                Token::Address(account),
                Token::Uint(U256::from(500u64)),
                Token::String("42".into()),
            ],
            120,
            9,
        );
        let event = contract.decode_log(&log, 1000).unwrap().unwrap();
        assert_eq!(event.event_name, names::WRAPPED);
        assert_eq!(event.block_number, 120);
        assert_eq!(event.value_str("amount"), Some("500"));
        assert_eq!(event.value_str("account"), Some("0x00000000000000000000000000000000000000aa"));
        assert_eq!(event.obt_id(), Some("42"));
        assert_eq!(event.observed_at, 1000);
    }

    #[test]
    fn unknown_topic_is_ignored() {
        let log = Log {
            topics: vec![H256::repeat_byte(0x11)],
            ..Default::default()
        };
        assert!(tokens().decode_log(&log, 0).unwrap().is_none());
    }

    #[test]
    fn nft_contract_decodes_token_ids() {
        let nft = BridgeContract::new(ChainCode::new("POL"), AssetType::Nft, NFT_ADDR).unwrap();
        let output = encode(&[Token::Uint(U256::from(77u64))]);
        assert_eq!(nft.decode_token_id(&output).unwrap(), U256::from(77u64));
    }
}
