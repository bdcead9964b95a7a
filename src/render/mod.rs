use std::collections::HashSet;

use alloy::primitives::Address;

use crate::config::ButtonRow;
use crate::delivery::chat::{InlineButton, InlineKeyboard};
use crate::ingest::types::NormalizedTx;
use crate::names::NameStore;
use crate::tokens::scale_amount;
use crate::trace::{TraceResult, TraceStatus};

/// Substituted with the per-watcher display name at broadcast time.
pub const NAME_PLACEHOLDER: &str = "$$NAME$$";
/// Substituted with the interacted token address in button URL templates.
pub const ADDRESS_PLACEHOLDER: &str = "$$ADDRESS$$";

/// Everything the renderer needs besides the per-message inputs. Built once
/// at startup from the configuration.
pub struct RenderConfig {
    pub chain_label: String,
    pub native_symbol: String,
    pub explorer_base_url: String,
    pub chart_base_url: String,
    pub base_tokens: HashSet<String>,
    pub button_rows: Vec<ButtonRow>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub text: String,
    pub buttons: Option<InlineKeyboard>,
}

/// Format one trace into chat-ready HTML plus optional inline buttons.
///
/// Pure: identical inputs produce byte-identical output. The text still
/// carries `$$NAME$$`; the delivery stage substitutes it per watcher.
pub fn render(
    watched: Address,
    tx: &NormalizedTx,
    trace: &TraceResult,
    signature: Option<&str>,
    names: &NameStore,
    config: &RenderConfig,
) -> Rendered {
    let mut text = String::new();

    let glyph = status_glyph(trace.status);
    let icon = direction_icon(watched, tx, trace);
    text.push_str(&format!(
        "{glyph}{icon} <b>{NAME_PLACEHOLDER}</b> on {}\n",
        config.chain_label
    ));

    let hash = format!("{:#x}", tx.hash);
    text.push_str(&format!(
        "<a href=\"{}{hash}\">{}</a> | block {}\n",
        config.explorer_base_url,
        short_hash(&hash),
        trace.block,
    ));

    let from_mark = if tx.from == watched { " \u{25cf}" } else { "" };
    text.push_str(&format!("From: {}{from_mark}\n", names.display(&tx.from)));

    match tx.to {
        Some(to) => {
            let to_mark = if to == watched { " \u{25cf}" } else { "" };
            text.push_str(&format!("To: {}{to_mark}\n", names.display(&to)));
        }
        None => text.push_str("To: contract creation\n"),
    }

    if let Some(deployed) = trace.deployed_contract {
        text.push_str(&format!("Deployed: {}\n", deployed.to_checksum(None)));
    }

    let selector = tx.selector();
    if selector != "0x" {
        match signature {
            Some(signature) => text.push_str(&format!("Call: {signature}\n")),
            None => text.push_str(&format!("Call: {selector}\n")),
        }
    }

    if !trace.tokens.is_empty() {
        let rendered: Vec<String> = trace
            .tokens
            .iter()
            .map(|(address, symbol)| {
                format!(
                    "<a href=\"{}{:#x}\">{symbol}</a>",
                    config.chart_base_url, address
                )
            })
            .collect();
        text.push_str(&format!("Tokens: {}\n", rendered.join(", ")));
    }

    if let Some(amount) = &trace.transfer_amount {
        // Exactly one token resolved whenever an amount is present
        let symbol = trace.tokens.first().map(|(_, s)| s.as_str()).unwrap_or("");
        text.push_str(&format!("Amount: {amount} {symbol}\n"));
    }

    if !tx.value.is_zero() {
        text.push_str(&format!(
            "Value: {} {}\n",
            scale_amount(tx.value, 18, 4),
            config.native_symbol
        ));
    }

    text.push_str(&format!(
        "PNL: {} {} | Balance: {} {}\n",
        trace.change, trace.pnl, trace.balance, config.native_symbol
    ));

    if let Some(log_count) = trace.log_count {
        text.push_str(&format!("Logs: {log_count}\n"));
    }

    Rendered {
        buttons: build_buttons(trace, config),
        text,
    }
}

fn status_glyph(status: TraceStatus) -> &'static str {
    match status {
        TraceStatus::Success => "\u{2705} ",
        TraceStatus::Failed => "\u{274c} ",
        TraceStatus::Unknown => "",
    }
}

/// Direction marker, most specific rule first: swap-shaped calls get a
/// buy/sell label, a single detected ERC20 transfer gets the money arrows,
/// everything else the plain in/out arrow.
fn direction_icon(watched: Address, tx: &NormalizedTx, trace: &TraceResult) -> String {
    if trace.tokens.len() > 1 {
        let sell = matches!(trace.status, TraceStatus::Failed)
            || (matches!(trace.status, TraceStatus::Success) && tx.value.is_zero());
        return if sell {
            "\u{1f534} SELL".to_string()
        } else {
            "\u{1f7e2} BUY".to_string()
        };
    }
    if trace.tokens.len() == 1 && trace.transfer_amount.is_some() {
        return if tx.from == watched {
            "\u{1f4b0}\u{27a1}\u{fe0f}".to_string()
        } else {
            "\u{27a1}\u{fe0f}\u{1f4b0}".to_string()
        };
    }
    if tx.to == Some(watched) {
        "\u{2198}".to_string()
    } else {
        "\u{2196}".to_string()
    }
}

fn short_hash(hash: &str) -> String {
    if hash.len() <= 18 {
        return hash.to_string();
    }
    format!("{}\u{2026}{}", &hash[..10], &hash[hash.len() - 8..])
}

/// Inline buttons are only attached when a non-base token was interacted
/// with; its address fills every URL template.
fn build_buttons(trace: &TraceResult, config: &RenderConfig) -> Option<InlineKeyboard> {
    if config.button_rows.is_empty() {
        return None;
    }
    let token = trace
        .tokens
        .iter()
        .find(|(_, symbol)| !config.base_tokens.contains(symbol))?;
    let address = format!("{:#x}", token.0);

    let rows: InlineKeyboard = config
        .button_rows
        .iter()
        .map(|row| {
            row.buttons
                .iter()
                .map(|template| InlineButton {
                    text: template.text.clone(),
                    url: template.url_template.replace(ADDRESS_PLACEHOLDER, &address),
                })
                .collect()
        })
        .collect();
    Some(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ButtonTemplate;
    use crate::ingest::types::TxOrigin;
    use crate::trace::BlockTag;
    use alloy::primitives::{address, Bytes, B256, U256};

    fn config() -> RenderConfig {
        RenderConfig {
            chain_label: "eth".to_string(),
            native_symbol: "ETH".to_string(),
            explorer_base_url: "https://explorer.example/tx/".to_string(),
            chart_base_url: "https://charts.example/token/".to_string(),
            base_tokens: ["WETH".to_string()].into_iter().collect(),
            button_rows: vec![ButtonRow {
                buttons: vec![ButtonTemplate {
                    text: "Chart".to_string(),
                    url_template: "https://charts.example/token/$$ADDRESS$$".to_string(),
                }],
            }],
        }
    }

    fn tx(from: Address, to: Option<Address>, value: U256) -> NormalizedTx {
        NormalizedTx {
            hash: B256::repeat_byte(0xab),
            block_number: Some(100),
            block_hash: None,
            index: Some(0),
            from,
            to,
            nonce: 1,
            gas_limit: 100_000,
            gas_price: Some(10),
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
            input: Bytes::new(),
            value,
            chain_id: Some(1),
            origin: TxOrigin::Block,
        }
    }

    fn trace(tokens: Vec<(Address, String)>, status: TraceStatus) -> TraceResult {
        TraceResult {
            status,
            tokens,
            log_count: Some(2),
            block: BlockTag::Number(100),
            deployed_contract: None,
            pnl: "0.000".to_string(),
            balance: "10.00".to_string(),
            change: '.',
            transfer_amount: None,
        }
    }

    #[test]
    fn test_render_is_deterministic() {
        let watched = address!("1111111111111111111111111111111111111111");
        let tx = tx(watched, Some(address!("2222222222222222222222222222222222222222")), U256::ZERO);
        let trace = trace(Vec::new(), TraceStatus::Unknown);
        let names = NameStore::empty();
        let a = render(watched, &tx, &trace, None, &names, &config());
        let b = render(watched, &tx, &trace, None, &names, &config());
        assert_eq!(a, b);
    }

    #[test]
    fn test_bullet_marks_watched_address() {
        let watched = address!("1111111111111111111111111111111111111111");
        let other = address!("2222222222222222222222222222222222222222");
        let tx = tx(other, Some(watched), U256::ZERO);
        let rendered = render(
            watched,
            &tx,
            &trace(Vec::new(), TraceStatus::Unknown),
            None,
            &NameStore::empty(),
            &config(),
        );
        let to_line = rendered
            .text
            .lines()
            .find(|l| l.starts_with("To:"))
            .unwrap();
        assert!(to_line.ends_with('\u{25cf}'));
        let from_line = rendered
            .text
            .lines()
            .find(|l| l.starts_with("From:"))
            .unwrap();
        assert!(!from_line.contains('\u{25cf}'));
    }

    #[test]
    fn test_direction_arrows() {
        let watched = address!("1111111111111111111111111111111111111111");
        let other = address!("2222222222222222222222222222222222222222");
        let names = NameStore::empty();
        let t = trace(Vec::new(), TraceStatus::Unknown);

        let incoming = render(watched, &tx(other, Some(watched), U256::ZERO), &t, None, &names, &config());
        assert!(incoming.text.starts_with('\u{2198}'));

        let outgoing = render(watched, &tx(watched, Some(other), U256::ZERO), &t, None, &names, &config());
        assert!(outgoing.text.starts_with('\u{2196}'));
    }

    #[test]
    fn test_single_transfer_overrides_icon() {
        let watched = address!("1111111111111111111111111111111111111111");
        let other = address!("2222222222222222222222222222222222222222");
        let token = address!("3333333333333333333333333333333333333333");
        let mut t = trace(vec![(token, "TKN".to_string())], TraceStatus::Unknown);
        t.transfer_amount = Some("100.00".to_string());

        let outgoing = render(
            watched,
            &tx(watched, Some(token), U256::ZERO),
            &t,
            None,
            &NameStore::empty(),
            &config(),
        );
        assert!(outgoing.text.starts_with("\u{1f4b0}\u{27a1}\u{fe0f}"));

        let incoming = render(
            watched,
            &tx(other, Some(token), U256::ZERO),
            &t,
            None,
            &NameStore::empty(),
            &config(),
        );
        assert!(incoming.text.starts_with("\u{27a1}\u{fe0f}\u{1f4b0}"));
    }

    #[test]
    fn test_multi_token_buy_sell_mapping() {
        let watched = address!("1111111111111111111111111111111111111111");
        let a = address!("3333333333333333333333333333333333333333");
        let b = address!("4444444444444444444444444444444444444444");
        let tokens = vec![(a, "TKN".to_string()), (b, "WETH".to_string())];
        let names = NameStore::empty();

        // Failed call renders as sell
        let failed = render(
            watched,
            &tx(watched, Some(a), U256::from(1)),
            &trace(tokens.clone(), TraceStatus::Failed),
            None,
            &names,
            &config(),
        );
        assert!(failed.text.contains("SELL"));

        // Success with zero value renders as sell
        let zero_value = render(
            watched,
            &tx(watched, Some(a), U256::ZERO),
            &trace(tokens.clone(), TraceStatus::Success),
            None,
            &names,
            &config(),
        );
        assert!(zero_value.text.contains("SELL"));

        // Success with value in renders as buy
        let buy = render(
            watched,
            &tx(watched, Some(a), U256::from(10).pow(U256::from(18))),
            &trace(tokens, TraceStatus::Success),
            None,
            &names,
            &config(),
        );
        assert!(buy.text.contains("BUY"));
    }

    #[test]
    fn test_buttons_only_for_non_base_tokens() {
        let watched = address!("1111111111111111111111111111111111111111");
        let weth = address!("c02aaa39b223fe8d0a0e5c4f27ead9083c756cc2");
        let tkn = address!("3333333333333333333333333333333333333333");
        let names = NameStore::empty();
        let transaction = tx(watched, Some(tkn), U256::ZERO);

        let base_only = render(
            watched,
            &transaction,
            &trace(vec![(weth, "WETH".to_string())], TraceStatus::Success),
            None,
            &names,
            &config(),
        );
        assert!(base_only.buttons.is_none());

        let with_tkn = render(
            watched,
            &transaction,
            &trace(
                vec![(tkn, "TKN".to_string()), (weth, "WETH".to_string())],
                TraceStatus::Success,
            ),
            None,
            &names,
            &config(),
        );
        let buttons = with_tkn.buttons.unwrap();
        assert_eq!(
            buttons[0][0].url,
            "https://charts.example/token/0x3333333333333333333333333333333333333333"
        );
    }

    #[test]
    fn test_status_glyphs() {
        let watched = address!("1111111111111111111111111111111111111111");
        let transaction = tx(watched, None, U256::ZERO);
        let names = NameStore::empty();

        let ok = render(watched, &transaction, &trace(Vec::new(), TraceStatus::Success), None, &names, &config());
        assert!(ok.text.starts_with('\u{2705}'));

        let failed = render(watched, &transaction, &trace(Vec::new(), TraceStatus::Failed), None, &names, &config());
        assert!(failed.text.starts_with('\u{274c}'));

        let unknown = render(watched, &transaction, &trace(Vec::new(), TraceStatus::Unknown), None, &names, &config());
        assert!(!unknown.text.starts_with('\u{2705}'));
        // Contract creation renders without a To line
        assert!(unknown.text.contains("To: contract creation"));
    }
}
