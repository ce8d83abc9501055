//! `hubctl check-flow` - evaluate a flow against the configured rules

use anyhow::{Context as AnyhowContext, Result, anyhow};
use colored::Colorize;
use converge::CloudClient;
use serde::Serialize;
use std::net::Ipv4Addr;

use crate::Context;
use crate::cidr::Ipv4Cidr;
use crate::cli::{FlowArgs, OutputFormat};
use crate::config::HubParameters;
use crate::flow::{Flow, FlowProtocol, RuleSet, Verdict};
use crate::topology::SUBNETS;
use crate::ui;

pub fn run(ctx: &Context, args: FlowArgs) -> Result<()> {
    let params = HubParameters::load_validated(&ctx.params)?;
    let client = ctx.backend.connect()?;
    let flow = parse_flow(&args)?;

    let verdict = evaluate(&params, client.as_ref(), &flow);
    match args.format {
        OutputFormat::Json => {
            let doc = FlowDocument {
                flow: &flow,
                allowed: verdict.is_allowed(),
                verdict: &verdict,
            };
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        OutputFormat::Text => print_verdict(&flow, &verdict),
    }
    Ok(())
}

#[derive(Serialize)]
struct FlowDocument<'a> {
    flow: &'a Flow,
    allowed: bool,
    verdict: &'a Verdict,
}

fn parse_flow(args: &FlowArgs) -> Result<Flow> {
    let protocol: FlowProtocol = args.protocol.parse().map_err(|e: String| anyhow!(e))?;
    let source: Ipv4Addr = args
        .source
        .parse()
        .with_context(|| format!("Invalid source address '{}'", args.source))?;
    let destination = args
        .destination
        .as_deref()
        .map(|d| {
            d.parse::<Ipv4Addr>()
                .with_context(|| format!("Invalid destination address '{d}'"))
        })
        .transpose()?;

    Ok(Flow {
        protocol,
        source,
        destination,
        port: args.port,
        fqdn: args.fqdn.clone(),
        service_tag: args.service_tag.clone(),
    })
}

/// Expand IP groups from the spoke subnets' live prefixes.
fn evaluate(params: &HubParameters, client: &dyn CloudClient, flow: &Flow) -> Verdict {
    let rules = RuleSet::from_params(params, |vnet, subnet| {
        let path = format!("/virtualNetworks/{vnet}/subnets/{subnet}");
        let prefix = match client.get(SUBNETS, &path) {
            Ok(Some(doc)) => doc["properties"]["addressPrefix"]
                .as_str()
                .and_then(|p| p.parse::<Ipv4Cidr>().ok()),
            Ok(None) => None,
            Err(e) => {
                log::warn!("Could not read {}: {}", path, e);
                None
            }
        };
        if prefix.is_none() {
            ui::warn(&format!("No address prefix for {vnet}/{subnet}; left out of its IP group"));
        }
        prefix
    });
    rules.evaluate(flow)
}

fn print_verdict(flow: &Flow, verdict: &Verdict) {
    let target = flow
        .fqdn
        .clone()
        .or_else(|| flow.destination.map(|d| d.to_string()))
        .unwrap_or_else(|| "*".to_string());
    let port = flow.port.map(|p| format!(":{p}")).unwrap_or_default();
    ui::header(&format!("{} {} → {}{}", flow.protocol, flow.source, target, port));

    match verdict {
        Verdict::Allow { .. } => ui::success("Allowed"),
        Verdict::Deny { .. } => println!("{} {}", "✗".red(), "Denied".red()),
        Verdict::Dnat {
            translated_address,
            translated_port,
            ..
        } => ui::success(&format!(
            "Translated to {}:{}",
            translated_address.as_deref().unwrap_or("?"),
            translated_port.as_deref().unwrap_or("?")
        )),
        Verdict::NoMatch => println!("{} {}", "✗".red(), "Denied (no rule matched)".red()),
    }

    if let Some(m) = verdict.matched() {
        ui::kv("Rule", &format!("{}/{}/{}", m.group, m.collection, m.rule));
        ui::kv("Collection type", &m.kind.to_string());
    }
}
