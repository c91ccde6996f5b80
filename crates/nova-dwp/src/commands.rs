//! Command-set and opcode numbering.

pub mod command_set {
    pub const VM: u8 = 1;
    pub const OBJECT_REF: u8 = 9;
    pub const STRING_REF: u8 = 10;
    pub const THREAD: u8 = 11;
    pub const ARRAY_REF: u8 = 13;
    pub const EVENT_REQUEST: u8 = 15;
    pub const STACK_FRAME: u8 = 16;
    pub const APPDOMAIN: u8 = 20;
    pub const ASSEMBLY: u8 = 21;
    pub const METHOD: u8 = 22;
    pub const TYPE: u8 = 23;
    pub const MODULE: u8 = 24;
    pub const FIELD: u8 = 25;
    pub const EVENT: u8 = 64;
}

pub mod vm {
    pub const VERSION: u8 = 1;
    pub const ALL_THREADS: u8 = 2;
    pub const SUSPEND: u8 = 3;
    pub const RESUME: u8 = 4;
    pub const EXIT: u8 = 5;
    pub const DISPOSE: u8 = 6;
    pub const INVOKE_METHOD: u8 = 7;
    pub const SET_PROTOCOL_VERSION: u8 = 8;
    pub const ABORT_INVOKE: u8 = 9;
    pub const GET_TYPES_FOR_SOURCE_FILE: u8 = 11;
    pub const GET_TYPES: u8 = 12;
    pub const INVOKE_METHODS: u8 = 13;
}

pub mod object_ref {
    pub const GET_TYPE: u8 = 1;
    pub const GET_VALUES: u8 = 2;
    pub const IS_COLLECTED: u8 = 3;
    pub const GET_ADDRESS: u8 = 4;
    pub const GET_DOMAIN: u8 = 5;
    pub const SET_VALUES: u8 = 6;
    pub const GET_INFO: u8 = 7;
}

pub mod string_ref {
    pub const GET_VALUE: u8 = 1;
    pub const GET_LENGTH: u8 = 2;
    pub const GET_CHARS: u8 = 3;
}

pub mod thread {
    pub const GET_FRAME_INFO: u8 = 1;
    pub const GET_NAME: u8 = 2;
    pub const GET_STATE: u8 = 3;
    pub const GET_INFO: u8 = 4;
    pub const GET_ID: u8 = 5;
    pub const GET_TID: u8 = 6;
}

pub mod array_ref {
    pub const GET_LENGTH: u8 = 1;
    pub const GET_VALUES: u8 = 2;
    pub const SET_VALUES: u8 = 3;
}

pub mod event_request {
    pub const SET: u8 = 1;
    pub const CLEAR: u8 = 2;
    pub const CLEAR_ALL_BREAKPOINTS: u8 = 3;
}

pub mod stack_frame {
    pub const GET_VALUES: u8 = 1;
    pub const GET_THIS: u8 = 2;
    pub const SET_VALUES: u8 = 3;
}

pub mod appdomain {
    pub const GET_ROOT_DOMAIN: u8 = 1;
    pub const GET_FRIENDLY_NAME: u8 = 2;
    pub const GET_ASSEMBLIES: u8 = 3;
    pub const GET_ENTRY_ASSEMBLY: u8 = 4;
    pub const CREATE_STRING: u8 = 5;
    pub const GET_CORLIB: u8 = 6;
    pub const CREATE_BOXED_VALUE: u8 = 7;
}

pub mod assembly {
    pub const GET_LOCATION: u8 = 1;
    pub const GET_ENTRY_POINT: u8 = 2;
    pub const GET_MANIFEST_MODULE: u8 = 3;
    pub const GET_OBJECT: u8 = 4;
    pub const GET_TYPE: u8 = 5;
    pub const GET_NAME: u8 = 6;
}

pub mod method {
    pub const GET_NAME: u8 = 1;
    pub const GET_DECLARING_TYPE: u8 = 2;
    pub const GET_DEBUG_INFO: u8 = 3;
    pub const GET_PARAM_INFO: u8 = 4;
    pub const GET_LOCALS_INFO: u8 = 5;
    pub const GET_INFO: u8 = 6;
    pub const GET_BODY: u8 = 7;
}

pub mod type_ {
    pub const GET_INFO: u8 = 1;
    pub const GET_METHODS: u8 = 2;
    pub const GET_FIELDS: u8 = 3;
    pub const GET_VALUES: u8 = 4;
    pub const GET_OBJECT: u8 = 5;
    pub const GET_SOURCE_FILES: u8 = 6;
    pub const SET_VALUES: u8 = 7;
    pub const IS_ASSIGNABLE_FROM: u8 = 8;
}

pub mod module {
    pub const GET_INFO: u8 = 1;
}

pub mod field {
    pub const GET_INFO: u8 = 1;
}

pub mod event {
    pub const COMPOSITE: u8 = 100;
}
