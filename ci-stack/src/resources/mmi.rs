//! High-level MMI.
//!
//! Only the high-level mode is offered: the module sends menus, lists and
//! enquiries as text objects and the host answers with a choice or a string.
//! Multi-part menus and lists (`*_more`) are collected before the host
//! sees them.

use bytes::BytesMut;
use ci_protocol::apdu::{
    decode_menu_body, decode_text, DISPLAY_CMD_SET_MMI_MODE, DISPLAY_REPLY_MMI_MODE_ACK,
    DISPLAY_REPLY_UNKNOWN_CMD, MMI_MODE_HIGH_LEVEL,
};
use ci_protocol::{CloseMmi, MmiAnswer, MmiApdu};
use log::{debug, warn};

use super::{HostCallbacks, Outbox};
use crate::error::ResourceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MmiMode {
    #[default]
    Closed,
    /// Display set up, nothing awaiting an answer.
    Open,
    /// An enquiry awaits `answ`.
    Enquiry,
    /// A menu awaits `menu_answ`.
    Menu,
    /// A list awaits `menu_answ`.
    List,
}

#[derive(Debug, Default)]
pub struct MmiState {
    mode: MmiMode,
    menu: BytesMut,
    list: BytesMut,
    text: BytesMut,
}

impl MmiState {
    pub fn mode(&self) -> MmiMode {
        self.mode
    }

    fn reset(&mut self) {
        self.mode = MmiMode::Closed;
        self.menu.clear();
        self.list.clear();
        self.text.clear();
    }

    pub fn handle(
        &mut self,
        session: u16,
        apdu: MmiApdu,
        callbacks: &mut dyn HostCallbacks,
        out: &mut Outbox,
    ) -> Result<(), ResourceError> {
        match apdu {
            MmiApdu::DisplayControl { cmd, mode } => {
                callbacks.mmi_display_control(session, cmd, mode);
                let reply = if cmd == DISPLAY_CMD_SET_MMI_MODE && mode == Some(MMI_MODE_HIGH_LEVEL)
                {
                    self.mode = MmiMode::Open;
                    MmiApdu::DisplayReply {
                        id: DISPLAY_REPLY_MMI_MODE_ACK,
                        mode: Some(MMI_MODE_HIGH_LEVEL),
                    }
                } else {
                    debug!("[MMI] session {} unsupported display control 0x{:02X}", session, cmd);
                    MmiApdu::DisplayReply {
                        id: DISPLAY_REPLY_UNKNOWN_CMD,
                        mode: None,
                    }
                };
                out.push((session, reply.encode()?));
            }
            MmiApdu::Close(close) => {
                self.reset();
                callbacks.mmi_close(session, close);
            }
            MmiApdu::Text { raw, more } => {
                self.text.extend_from_slice(&raw);
                if !more {
                    let text = decode_text(&self.text.split());
                    callbacks.mmi_text(session, &text);
                }
            }
            MmiApdu::Enq {
                blind,
                answer_length,
                text,
            } => {
                self.mode = MmiMode::Enquiry;
                callbacks.mmi_enquiry(session, blind, answer_length, &text);
            }
            MmiApdu::Menu { raw, more } => {
                self.menu.extend_from_slice(&raw);
                if !more {
                    let menu = decode_menu_body(&self.menu.split())?;
                    self.mode = MmiMode::Menu;
                    callbacks.mmi_menu(session, &menu);
                }
            }
            MmiApdu::List { raw, more } => {
                self.list.extend_from_slice(&raw);
                if !more {
                    let list = decode_menu_body(&self.list.split())?;
                    self.mode = MmiMode::List;
                    callbacks.mmi_list(session, &list);
                }
            }
            MmiApdu::KeypadControl { cmd, .. } => {
                debug!("[MMI] session {} ignoring keypad control 0x{:02X}", session, cmd);
            }
            other => warn!("[MMI] session {} unexpected {:?}", session, other),
        }
        Ok(())
    }

    /// Answer the pending enquiry.
    pub fn answer(
        &mut self,
        session: u16,
        answer: MmiAnswer,
        out: &mut Outbox,
    ) -> Result<(), ResourceError> {
        if self.mode != MmiMode::Enquiry {
            return Err(ResourceError::WrongState {
                session,
                expected: "enquiry",
            });
        }
        out.push((session, MmiApdu::Answ(answer).encode()?));
        self.mode = MmiMode::Open;
        Ok(())
    }

    /// Pick an item of the pending menu or list. 0 backs out.
    pub fn menu_answer(
        &mut self,
        session: u16,
        choice: u8,
        out: &mut Outbox,
    ) -> Result<(), ResourceError> {
        if !matches!(self.mode, MmiMode::Menu | MmiMode::List) {
            return Err(ResourceError::WrongState {
                session,
                expected: "menu or list",
            });
        }
        out.push((session, MmiApdu::MenuAnsw(choice).encode()?));
        self.mode = MmiMode::Open;
        Ok(())
    }

    pub fn close(&mut self, session: u16, out: &mut Outbox) -> Result<(), ResourceError> {
        out.push((session, MmiApdu::Close(CloseMmi::Immediate).encode()?));
        self.reset();
        Ok(())
    }
}
