//! Box and token netting.
//!
//! A transaction spends whole boxes and returns the change to the sender,
//! so the raw lists overstate what actually moved. [`reduce`] folds the boxes
//! per address and cancels out the change, leaving only the net transfer.

use std::collections::{BTreeMap, HashMap};

use crate::{
    error::{Error, Result},
    types::{TokenRef, TransactionSummary, TxBox},
};

struct Group {
    key: String,
    address: Option<String>,
    box_id: Option<String>,
    value: i64,
    tokens: BTreeMap<String, TokenRef>,
}

impl Group {
    fn is_empty(&self) -> bool {
        self.value == 0 && self.tokens.is_empty()
    }

    fn into_box(self) -> TxBox {
        TxBox {
            box_id: self.box_id,
            address: self.address,
            value: self.value,
            tokens: self.tokens.into_values().collect(),
            ..TxBox::default()
        }
    }
}

fn group_key(b: &TxBox) -> String {
    b.address
        .clone()
        .or_else(|| b.box_id.clone())
        .unwrap_or_default()
}

fn combine(boxes: &[TxBox]) -> Result<Vec<Group>> {
    let mut groups: Vec<Group> = vec![];
    let mut index: HashMap<String, usize> = HashMap::new();
    for b in boxes {
        if b.value < 0 {
            return Err(Error::InvariantViolation(format!(
                "negative value {} in box {:?}",
                b.value, b.box_id
            )));
        }
        let key = group_key(b);
        let i = *index.entry(key.clone()).or_insert_with(|| {
            groups.push(Group {
                key,
                address: b.address.clone(),
                box_id: b.box_id.clone(),
                value: 0,
                tokens: BTreeMap::new(),
            });
            groups.len() - 1
        });
        let group = &mut groups[i];
        group.value = group
            .value
            .checked_add(b.value)
            .ok_or_else(|| Error::InvariantViolation("value overflow".to_string()))?;
        for t in b.tokens.iter() {
            if t.amount < 0 {
                return Err(Error::InvariantViolation(format!(
                    "negative amount {} of token {}",
                    t.amount, t.token_id
                )));
            }
            let combined = group
                .tokens
                .entry(t.token_id.clone())
                .or_insert_with(|| TokenRef {
                    token_id: t.token_id.clone(),
                    ..TokenRef::default()
                });
            combined.amount = combined
                .amount
                .checked_add(t.amount)
                .ok_or_else(|| Error::InvariantViolation("token amount overflow".to_string()))?;
            if combined.name.is_none() {
                combined.name = t.name.clone();
            }
            if combined.decimals.is_none() {
                combined.decimals = t.decimals;
            }
        }
    }
    Ok(groups)
}

fn net(input: &mut Group, output: &mut Group) -> Result<()> {
    let value = input.value.min(output.value);
    input.value -= value;
    output.value -= value;

    for (token_id, in_token) in input.tokens.iter_mut() {
        if let Some(out_token) = output.tokens.get_mut(token_id) {
            let amount = in_token.amount.min(out_token.amount);
            in_token.amount -= amount;
            out_token.amount -= amount;
        }
    }
    input.tokens.retain(|_, t| t.amount != 0);
    output.tokens.retain(|_, t| t.amount != 0);

    if input.value < 0 || output.value < 0 {
        return Err(Error::InvariantViolation(format!(
            "netting {} went negative",
            input.key
        )));
    }
    Ok(())
}

/// Merges boxes by address and removes the change going back to the
/// spending addresses. Netting a result again leaves it unchanged.
pub fn reduce(tx: &TransactionSummary) -> Result<TransactionSummary> {
    let mut inputs = combine(&tx.inputs)?;
    let mut outputs = combine(&tx.outputs)?;

    let output_index = outputs
        .iter()
        .enumerate()
        .map(|(i, g)| (g.key.clone(), i))
        .collect::<HashMap<_, _>>();
    for input in inputs.iter_mut() {
        if let Some(&i) = output_index.get(&input.key) {
            net(input, &mut outputs[i])?;
        }
    }

    // a lone entry stays as a skeleton so a self transfer is not shown as nothing
    let single_input = inputs.len() == 1;
    let single_output = outputs.len() == 1;
    let inputs = inputs
        .into_iter()
        .filter(|g| !g.is_empty() || g.address.is_none() || single_input)
        .map(Group::into_box)
        .collect();
    let outputs = outputs
        .into_iter()
        .filter(|g| !g.is_empty() || single_output)
        .map(Group::into_box)
        .collect();

    Ok(TransactionSummary {
        id: tx.id.clone(),
        inputs,
        outputs,
    })
}

/// Copies token names and decimals known from the inputs onto the outputs
pub fn annotate_output_tokens(inputs: &[TxBox], outputs: &[TxBox]) -> Vec<TxBox> {
    let mut known: HashMap<&str, (Option<&String>, Option<u32>)> = HashMap::new();
    for t in inputs.iter().flat_map(|b| b.tokens.iter()) {
        if t.name.is_some() || t.decimals.is_some() {
            known.insert(&t.token_id, (t.name.as_ref(), t.decimals));
        }
    }
    outputs
        .iter()
        .map(|b| {
            let mut b = b.clone();
            for t in b.tokens.iter_mut() {
                if let Some((name, decimals)) = known.get(t.token_id.as_str()) {
                    if t.name.is_none() {
                        t.name = name.cloned();
                    }
                    if t.decimals.is_none() {
                        t.decimals = *decimals;
                    }
                }
            }
            b
        })
        .collect()
}

/// Tokens spent by the inputs but not issued again by any output
pub fn burned_tokens(inputs: &[TxBox], outputs: &[TxBox]) -> Vec<TokenRef> {
    let mut balance: BTreeMap<&str, (i64, &TokenRef)> = BTreeMap::new();
    for t in inputs.iter().flat_map(|b| b.tokens.iter()) {
        let e = balance.entry(&t.token_id).or_insert((0, t));
        e.0 += t.amount;
    }
    for t in outputs.iter().flat_map(|b| b.tokens.iter()) {
        if let Some(e) = balance.get_mut(t.token_id.as_str()) {
            e.0 -= t.amount;
        }
    }
    balance
        .into_values()
        .filter(|(amount, _)| *amount > 0)
        .map(|(amount, t)| TokenRef {
            amount,
            ..t.clone()
        })
        .collect()
}
