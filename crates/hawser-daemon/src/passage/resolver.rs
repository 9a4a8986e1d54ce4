//! Passage derivation: compute the exact credential/forwarding set one
//! node should currently enforce.
//!
//! Pure given the store state: identical tickets and server records always
//! produce the same passage set, so a full-state push is idempotent.
//! Errors are not-found only; callers treat them as "no passages, log and
//! skip", never as fatal.

use tracing::warn;

use super::{Argument, Passage, PassageIn, PassageOut};
use crate::storage::{Database, DatabaseError, Server, TicketType};

/// Resolve the passage set for the node identified by `node_ticket`.
pub async fn passages_for_node(
    db: &Database,
    node_ticket: &str,
    now: i64,
) -> Result<Vec<Passage>, DatabaseError> {
    let ticket = db.get_ticket(node_ticket).await?;
    let node = db.get_server(node_ticket).await?;

    // Exhausted endpoints stop receiving routable credentials. This is
    // push-time policy: connections already open are unaffected.
    if ticket.ticket_type == TicketType::Server && node.bandwidth.exhausted() {
        return Ok(Vec::new());
    }

    let counterpart = ticket.ticket_type.counterpart();
    let mut user_tickets: Vec<String> = Vec::new();
    let mut siblings: Vec<Server> = Vec::new();

    for sibling in db.tickets_by_chat(&ticket.chat_identifier).await? {
        if sibling.ticket == ticket.ticket || sibling.expired(now) {
            continue;
        }
        if sibling.ticket_type == TicketType::User {
            user_tickets.push(sibling.ticket);
        } else if Some(sibling.ticket_type) == counterpart {
            match db.get_server(&sibling.ticket).await {
                Ok(server) => siblings.push(server),
                // A ticket without a server record just has not
                // registered yet; anything else is an inconsistency we
                // keep rather than delete.
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(ticket = %sibling.ticket, error = %e, "Cannot load sibling node");
                }
            }
        }
    }

    let mut passages = Vec::new();
    match ticket.ticket_type {
        TicketType::Server => {
            let protocol = node.argument.protocol;
            for user in &user_tickets {
                passages.push(Passage {
                    inbound: PassageIn {
                        from: None,
                        argument: Argument::for_user(protocol, &node.ticket, user),
                    },
                    outbound: None,
                });
            }
            if !node.no_relay {
                for relay in &siblings {
                    if relay.is_down()
                        || relay.bandwidth.exhausted()
                        || relay.argument.protocol != protocol
                    {
                        continue;
                    }
                    passages.push(Passage {
                        inbound: PassageIn {
                            from: Some(relay.name.clone()),
                            argument: Argument::for_user(protocol, &node.ticket, &relay.ticket),
                        },
                        outbound: None,
                    });
                }
            }
        }
        TicketType::Relay => {
            for server in &siblings {
                if server.no_relay
                    || server.is_down()
                    || server.bandwidth.exhausted()
                    || server.argument.protocol != node.argument.protocol
                {
                    continue;
                }
                let protocol = server.argument.protocol;
                // The credential this relay presents outbound to the
                // endpoint; shared by every user routed through it.
                let outbound_argument =
                    Argument::for_user(protocol, &server.ticket, &node.ticket);
                for user in &user_tickets {
                    passages.push(Passage {
                        inbound: PassageIn {
                            from: None,
                            argument: Argument::for_relay_user(
                                protocol,
                                &server.ticket,
                                &node.ticket,
                                user,
                            ),
                        },
                        outbound: Some(PassageOut {
                            to: server.name.clone(),
                            host: server.first_host().to_string(),
                            port: server.port,
                            argument: outbound_argument.clone(),
                        }),
                    });
                }
            }
        }
        TicketType::User => {}
    }

    Ok(passages)
}
